#[cfg(test)]
mod tests {
    use crate::*;
    use futures::StreamExt;
    use kairos_common::{ChatMessage, ConversationId, Error, GenerationParams, Role};
    use kairos_config::{FilterConfig, RuntimeConfig};
    use tokio_util::sync::CancellationToken;

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let event = serde_json::json!({ "content": fragment, "stop": false });
            body.push_str(&format!("data: {}\n\n", event));
        }
        body.push_str("data: {\"content\":\"\",\"stop\":true}\n\n");
        body
    }

    fn history() -> Vec<ChatMessage> {
        vec![ChatMessage::new(
            ConversationId::new(),
            Role::User,
            "What is the capital of France?",
        )]
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            startup_timeout_secs: 1,
            ..RuntimeConfig::default()
        }
    }

    async fn initialized_engine(server: &mut mockito::ServerGuard) -> (LlamaServerEngine, tempfile::NamedTempFile) {
        server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let model = tempfile::NamedTempFile::new().unwrap();
        let mut engine = LlamaServerEngine::attach(server.url(), test_config()).unwrap();
        engine.initialize(model.path()).await.unwrap();
        (engine, model)
    }

    #[tokio::test]
    async fn test_generate_before_initialize_fails() {
        let engine = LlamaServerEngine::attach("http://127.0.0.1:1", test_config()).unwrap();

        assert!(!engine.is_initialized());
        let result = engine
            .generate(&history(), &GenerationParams::default(), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::RuntimeNotReady)));
    }

    #[tokio::test]
    async fn test_initialize_missing_model_fails() {
        let mut engine = LlamaServerEngine::attach("http://127.0.0.1:1", test_config()).unwrap();

        let result = engine
            .initialize(std::path::Path::new("/no/such/model.gguf"))
            .await;

        assert!(matches!(result, Err(Error::ModelLoadFailed(_))));
        assert!(!engine.is_initialized());
    }

    #[tokio::test]
    async fn test_initialize_unhealthy_server_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let model = tempfile::NamedTempFile::new().unwrap();
        let mut engine = LlamaServerEngine::attach(server.url(), test_config()).unwrap();

        let result = engine.initialize(model.path()).await;
        assert!(matches!(result, Err(Error::ModelLoadFailed(_))));
    }

    #[tokio::test]
    async fn test_streamed_completion_is_filtered() {
        let mut server = mockito::Server::new_async().await;
        let (engine, _model) = initialized_engine(&mut server).await;

        let completion = server
            .mock("POST", "/completion")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({ "stream": true })))
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(sse_body(&["The capital ", "is Paris.", "\nUs", "er: and Spain?"]))
            .create_async()
            .await;

        let filter = StreamFilter::from_config(&FilterConfig::default()).unwrap();
        let raw = engine
            .generate(&history(), &GenerationParams::default(), CancellationToken::new())
            .await
            .unwrap();
        let text: String = filter
            .apply(raw, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(text, "The capital is Paris.");
        completion.assert_async().await;
    }

    #[tokio::test]
    async fn test_prompt_uses_instruction_template() {
        let mut server = mockito::Server::new_async().await;
        let (engine, _model) = initialized_engine(&mut server).await;

        let completion = server
            .mock("POST", "/completion")
            .match_body(mockito::Matcher::Regex(
                r"### User:\\nWhat is the capital of France\?\\n\\n### Assistant:".to_string(),
            ))
            .with_status(200)
            .with_body(sse_body(&["Paris."]))
            .create_async()
            .await;

        let raw: Vec<String> = engine
            .generate(&history(), &GenerationParams::default(), CancellationToken::new())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(raw, vec!["Paris.".to_string()]);
        completion.assert_async().await;
    }

    #[tokio::test]
    async fn test_echoed_assistant_tags_are_dropped() {
        let mut server = mockito::Server::new_async().await;
        let (engine, _model) = initialized_engine(&mut server).await;

        server
            .mock("POST", "/completion")
            .with_status(200)
            .with_body(sse_body(&["<|assistant|>", "Hello", " world"]))
            .create_async()
            .await;

        let raw: Vec<String> = engine
            .generate(&history(), &GenerationParams::default(), CancellationToken::new())
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(raw.concat(), "Hello world");
    }

    #[tokio::test]
    async fn test_server_error_is_a_runtime_error() {
        let mut server = mockito::Server::new_async().await;
        let (engine, _model) = initialized_engine(&mut server).await;

        server
            .mock("POST", "/completion")
            .with_status(500)
            .create_async()
            .await;

        let result = engine
            .generate(&history(), &GenerationParams::default(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(Error::RuntimeError(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mut server = mockito::Server::new_async().await;
        let (engine, _model) = initialized_engine(&mut server).await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = engine
            .generate(&history(), &GenerationParams::default(), cancel)
            .await;

        assert!(matches!(result, Err(ref e) if e.is_cancellation()));
    }
}
