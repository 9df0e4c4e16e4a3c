#[cfg(test)]
mod tests {
    use crate::dto::*;
    use crate::error::Error;
    use crate::observability::GenerationId;

    #[test]
    fn test_role_round_trip() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!("Assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!(matches!("system".parse::<Role>(), Err(Error::BadRequest(_))));

        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_message_validation() {
        let id = ConversationId::new();

        let msg = ChatMessage::new(id.clone(), Role::User, "Hello");
        assert!(msg.validate().is_ok());

        let msg = ChatMessage::new(id.clone(), Role::User, "   ");
        assert!(matches!(msg.validate(), Err(Error::BadRequest(_))));

        let msg = ChatMessage::new(id, Role::User, "x".repeat(100_001));
        assert!(matches!(msg.validate(), Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_short_title_is_kept() {
        let title = derive_title("What is the capital of France?");
        assert_eq!(title, "What is the capital of France?");
    }

    #[test]
    fn test_long_title_is_truncated() {
        let text = "abcdefghij".repeat(5);
        assert_eq!(text.chars().count(), 50);

        let title = derive_title(&text);
        assert_eq!(title, format!("{}...", &text[..30]));
    }

    #[test]
    fn test_title_truncation_respects_char_boundaries() {
        let text = "é".repeat(40);
        let title = derive_title(&text);
        assert_eq!(title, format!("{}...", "é".repeat(30)));
    }

    #[test]
    fn test_conversation_touch_keeps_invariant() {
        let mut conversation = Conversation::new(DEFAULT_CONVERSATION_TITLE);
        let created = conversation.created_at;

        conversation.push_message(ChatMessage::new(
            conversation.id.clone(),
            Role::User,
            "hi",
        ));

        assert!(conversation.last_updated >= created);
        assert_eq!(conversation.messages.len(), 1);
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::DownloadFailed("x".into()).category(), "acquisition");
        assert_eq!(Error::RuntimeNotReady.category(), "initialization");
        assert_eq!(Error::Storage("x".into()).category(), "persistence");
        assert!(Error::Cancelled("user".into()).is_cancellation());
        assert!(!Error::RuntimeError("boom".into()).is_cancellation());
        assert!(Error::HttpStatus { status: 503, url: "u".into() }.is_retryable());
    }

    #[test]
    fn test_generation_ids_are_unique() {
        let a = GenerationId::new();
        let b = GenerationId::new();
        assert_ne!(a, b);
        assert_eq!(serde_json::to_string(&a).unwrap(), format!("\"{}\"", a));
    }
}
