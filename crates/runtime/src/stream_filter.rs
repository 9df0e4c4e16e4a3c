use crate::FragmentStream;
use futures::StreamExt;
use kairos_common::{Error, Result};
use kairos_config::FilterConfig;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Sliding-window stop marker filter.
///
/// Raw fragments are accumulated in a buffer. Everything except the last
/// `window` characters is released as soon as it cannot be the start of a
/// marker; the moment a marker completes the buffer is cut at the marker's
/// start and the stream ends.
#[derive(Debug, Clone)]
pub struct StreamFilter {
    markers: Arc<[String]>,
    role_tags: Arc<[String]>,
    window: usize,
}

impl StreamFilter {
    /// Create a filter with an explicit trailing window (in characters).
    ///
    /// The window must be at least the longest marker length minus one,
    /// otherwise a marker split across fragments could be released before
    /// it is recognised.
    pub fn new(markers: Vec<String>, window: usize) -> Result<Self> {
        if markers.iter().any(|m| m.is_empty()) {
            return Err(Error::ConfigError("Stop markers cannot be empty".into()));
        }

        let required = Self::minimal_window(&markers);
        if window < required {
            return Err(Error::ConfigError(format!(
                "Filter window {} is smaller than the required {} characters",
                window, required
            )));
        }

        let role_tags = derive_role_tags(&markers);

        Ok(Self {
            markers: markers.into(),
            role_tags: role_tags.into(),
            window,
        })
    }

    /// Create a filter with the smallest window the markers allow
    pub fn with_markers(markers: Vec<String>) -> Result<Self> {
        let window = Self::minimal_window(&markers);
        Self::new(markers, window)
    }

    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        match config.window {
            Some(window) => Self::new(config.stop_markers.clone(), window),
            None => Self::with_markers(config.stop_markers.clone()),
        }
    }

    fn minimal_window(markers: &[String]) -> usize {
        markers
            .iter()
            .map(|m| m.chars().count())
            .max()
            .unwrap_or(0)
            .saturating_sub(1)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Fresh per-stream state
    pub fn session(&self) -> FilterSession {
        FilterSession {
            filter: self.clone(),
            buffer: String::new(),
            last_emitted: None,
            finished: false,
        }
    }

    /// Wrap an upstream fragment stream.
    ///
    /// An upstream error flushes the buffered text, is forwarded, and ends
    /// the stream. Once `cancel` fires no further fragments are produced and
    /// the buffer is dropped.
    pub fn apply(&self, mut upstream: FragmentStream, cancel: CancellationToken) -> FragmentStream {
        let mut session = self.session();

        Box::pin(async_stream::stream! {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Filter observed cancellation, dropping buffered text");
                        return;
                    }
                    item = upstream.next() => item,
                };

                if cancel.is_cancelled() {
                    return;
                }

                match next {
                    Some(Ok(fragment)) => match session.push(&fragment) {
                        FilterStep::Pending => {}
                        FilterStep::Emit(text) => yield Ok(text),
                        FilterStep::Stop(text) => {
                            if let Some(text) = text {
                                yield Ok(text);
                            }
                            return;
                        }
                    },
                    Some(Err(e)) => {
                        if let Some(tail) = session.finish() {
                            yield Ok(tail);
                        }
                        yield Err(e);
                        return;
                    }
                    None => {
                        if let Some(tail) = session.finish() {
                            yield Ok(tail);
                        }
                        return;
                    }
                }
            }
        })
    }
}

/// Role labels such as `User` or `### User`, taken from the `...:` markers
fn derive_role_tags(markers: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for marker in markers {
        let trimmed = marker.trim();
        let Some(label) = trimmed.strip_suffix(':') else {
            continue;
        };
        let label = label.trim();
        if !label.is_empty() && !tags.iter().any(|t| t == label) {
            tags.push(label.to_string());
        }
    }
    tags
}

fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Outcome of feeding one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterStep {
    /// Nothing safe to release yet
    Pending,
    /// Text that can be shown now
    Emit(String),
    /// A marker was found; the final text before it, if any
    Stop(Option<String>),
}

/// Buffer state for one generation
#[derive(Debug)]
pub struct FilterSession {
    filter: StreamFilter,
    buffer: String,
    /// Last released character other than a space or tab
    last_emitted: Option<char>,
    finished: bool,
}

impl FilterSession {
    pub fn push(&mut self, fragment: &str) -> FilterStep {
        if self.finished {
            return FilterStep::Stop(None);
        }
        if fragment.is_empty() {
            return FilterStep::Pending;
        }

        self.buffer.push_str(fragment);

        if let Some(cut) = self.earliest_marker() {
            self.finished = true;
            self.buffer.truncate(cut);
            let prefix = std::mem::take(&mut self.buffer);
            if prefix.is_empty() || self.is_partial_marker(&prefix) {
                return FilterStep::Stop(None);
            }
            return FilterStep::Stop(Some(prefix));
        }

        let len = self.buffer.chars().count();
        if len <= self.filter.window {
            return FilterStep::Pending;
        }

        let keep_from = self
            .buffer
            .char_indices()
            .nth(len - self.filter.window)
            .map(|(i, _)| i)
            .unwrap_or(self.buffer.len());
        let kept = self.buffer.split_off(keep_from);
        let released = std::mem::replace(&mut self.buffer, kept);
        if let Some(c) = released.chars().rev().find(|c| !is_blank(*c)) {
            self.last_emitted = Some(c);
        }
        FilterStep::Emit(released)
    }

    /// Flush at natural end of the upstream.
    ///
    /// A role label left alone on the last line is cut off together with
    /// the whitespace before it.
    pub fn finish(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let mut tail = std::mem::take(&mut self.buffer);
        if let Some(cut) = self.dangling_role_tag(&tail) {
            tail.truncate(cut);
            tail.truncate(tail.trim_end().len());
        }

        if tail.is_empty() {
            None
        } else {
            Some(tail)
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn earliest_marker(&self) -> Option<usize> {
        self.filter
            .markers
            .iter()
            .filter_map(|m| self.buffer.find(m.as_str()))
            .min()
    }

    fn is_partial_marker(&self, text: &str) -> bool {
        self.filter
            .markers
            .iter()
            .any(|m| m.len() > text.len() && m.starts_with(text))
    }

    fn dangling_role_tag(&self, tail: &str) -> Option<usize> {
        self.filter
            .role_tags
            .iter()
            .filter_map(|tag| {
                tail.match_indices(tag.as_str()).find_map(|(pos, _)| {
                    let before = tail[..pos].trim_end_matches(is_blank);
                    let at_line_start = match before.chars().next_back() {
                        Some(c) => c == '\n',
                        None => self.last_emitted.map_or(true, |c| c == '\n'),
                    };
                    let rest = &tail[pos + tag.len()..];
                    let dangling = rest.chars().all(|c| c.is_whitespace() || c == ':');
                    (at_line_start && dangling).then_some(pos)
                })
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn default_filter() -> StreamFilter {
        StreamFilter::from_config(&FilterConfig::default()).unwrap()
    }

    fn run(filter: &StreamFilter, fragments: &[&str]) -> Vec<String> {
        let mut session = filter.session();
        let mut out = Vec::new();
        for fragment in fragments {
            match session.push(fragment) {
                FilterStep::Pending => {}
                FilterStep::Emit(text) => out.push(text),
                FilterStep::Stop(text) => {
                    out.extend(text);
                    return out;
                }
            }
        }
        out.extend(session.finish());
        out
    }

    #[test]
    fn test_minimal_window_is_derived() {
        let filter = default_filter();
        // "<|endoftext|>" is the longest default marker
        assert_eq!(filter.window(), 12);
    }

    #[test]
    fn test_window_too_small_is_rejected() {
        let result = StreamFilter::new(vec!["User:".to_string()], 3);
        assert!(matches!(result, Err(Error::ConfigError(_))));

        assert!(StreamFilter::new(vec!["User:".to_string()], 4).is_ok());
        assert!(StreamFilter::new(vec![String::new()], 10).is_err());
    }

    #[test]
    fn test_role_tags() {
        let tags = derive_role_tags(&FilterConfig::default().stop_markers);
        assert_eq!(tags, vec!["User".to_string(), "### User".to_string()]);
    }

    #[test]
    fn test_passthrough_without_markers() {
        let filter = default_filter();
        let out = run(&filter, &["The capital ", "of France ", "is Paris."]);
        assert_eq!(out.concat(), "The capital of France is Paris.");
    }

    #[test]
    fn test_marker_in_single_fragment() {
        let filter = default_filter();
        let out = run(&filter, &["Paris.\nUser: and Spain?"]);
        assert_eq!(out.concat(), "Paris.");
    }

    #[test]
    fn test_marker_split_across_fragments() {
        let filter = default_filter();
        let out = run(
            &filter,
            &["It is Paris, a lovely city.", "\nUs", "er", ": what", " about Rome?"],
        );
        let joined = out.concat();
        assert_eq!(joined, "It is Paris, a lovely city.");
        assert!(!joined.contains("User"));
    }

    #[test]
    fn test_nothing_after_stop() {
        let filter = default_filter();
        let mut session = filter.session();

        assert_eq!(session.push("Hello</s>"), FilterStep::Stop(Some("Hello".to_string())));
        assert_eq!(session.push("more text that is long enough"), FilterStep::Stop(None));
        assert_eq!(session.finish(), None);
        assert!(session.is_finished());
    }

    #[test]
    fn test_earliest_marker_wins() {
        let filter = default_filter();
        let out = run(&filter, &["Answer<|im_end|> trailing </s>"]);
        assert_eq!(out.concat(), "Answer");
    }

    #[test]
    fn test_fragmentation_invariance() {
        let filter = default_filter();
        let text = "Rust guarantees memory safety without a garbage collector.\n\nUser: thanks";
        let expected = run(&filter, &[text]).concat();
        assert_eq!(expected, "Rust guarantees memory safety without a garbage collector.");

        let chars: Vec<char> = text.chars().collect();
        for size in 1..=17 {
            let pieces: Vec<String> = chars.chunks(size).map(|c| c.iter().collect()).collect();
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            assert_eq!(run(&filter, &refs).concat(), expected, "chunk size {}", size);
        }
    }

    #[test]
    fn test_output_held_back_by_window() {
        let filter = StreamFilter::new(vec!["STOP".to_string()], 3).unwrap();
        let mut session = filter.session();

        assert_eq!(session.push("abc"), FilterStep::Pending);
        assert_eq!(session.push("defg"), FilterStep::Emit("abcd".to_string()));
        assert_eq!(session.finish(), Some("efg".to_string()));
    }

    #[test]
    fn test_multibyte_window() {
        let filter = StreamFilter::new(vec!["STOP".to_string()], 3).unwrap();
        let out = run(&filter, &["héllo wörld", "ST", "OP ignored"]);
        assert_eq!(out.concat(), "héllo wörld");
    }

    #[test]
    fn test_empty_and_repeated_fragments() {
        let filter = default_filter();
        let out = run(&filter, &["", "ab", "", "ab", "ab", ""]);
        assert_eq!(out.concat(), "ababab");
    }

    #[test]
    fn test_partial_marker_prefix_is_dropped() {
        let filter = default_filter();
        let out = run(&filter, &["<", "</s>"]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_dangling_role_label_is_cut() {
        let filter = default_filter();
        let out = run(&filter, &["The answer is 42.", "\n\nUser"]);
        assert_eq!(out.concat(), "The answer is 42.");

        let out = run(&filter, &["Done.\n### User"]);
        assert_eq!(out.concat(), "Done.");
    }

    #[test]
    fn test_answer_ending_in_role_word_is_kept() {
        let filter = default_filter();
        let out = run(&filter, &["The account belongs to the ", "User"]);
        assert_eq!(out.concat(), "The account belongs to the User");

        // A window of four leaves only the label buffered
        let narrow = StreamFilter::new(vec!["User:".to_string()], 4).unwrap();
        let out = run(&narrow, &["Granted by the admin, not the ", "User"]);
        assert_eq!(out.concat(), "Granted by the admin, not the User");

        // The newline was already released, so only the label goes
        let out = run(&narrow, &["Done.\n", "User"]);
        assert_eq!(out.concat(), "Done.\n");

        let out = run(&filter, &["User"]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_role_word_inside_sentence_is_kept() {
        let filter = default_filter();
        let out = run(&filter, &["Ask the User nicely"]);
        assert_eq!(out.concat(), "Ask the User nicely");
    }

    fn upstream(items: Vec<Result<String>>) -> FragmentStream {
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_apply_stops_at_marker() {
        let filter = default_filter();
        let source = upstream(vec![
            Ok("Hello there, ".to_string()),
            Ok("friend.".to_string()),
            Ok("\nUser: again".to_string()),
            Ok("never seen".to_string()),
        ]);

        let out: Vec<String> = filter
            .apply(source, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(out.concat(), "Hello there, friend.");
    }

    #[tokio::test]
    async fn test_apply_forwards_errors() {
        let filter = default_filter();
        let source = upstream(vec![
            Ok("partial".to_string()),
            Err(Error::RuntimeError("boom".into())),
            Ok("never seen".to_string()),
        ]);

        let items: Vec<Result<String>> = filter.apply(source, CancellationToken::new()).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(Error::RuntimeError(_))));
    }

    #[tokio::test]
    async fn test_apply_error_keeps_text_before_it() {
        let filter = default_filter();
        let source = upstream(vec![
            Ok("The answer is forty-two".to_string()),
            Err(Error::RuntimeError("boom".into())),
        ]);

        let items: Vec<Result<String>> = filter.apply(source, CancellationToken::new()).collect().await;

        let text: String = items.iter().filter_map(|r| r.as_ref().ok()).map(String::as_str).collect();
        assert_eq!(text, "The answer is forty-two");
        assert!(matches!(items.last(), Some(Err(Error::RuntimeError(_)))));
    }

    #[tokio::test]
    async fn test_apply_cancelled_does_not_flush() {
        let filter = default_filter();
        let cancel = CancellationToken::new();
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<String>>();

        let mut filtered = filter.apply(Box::pin(rx), cancel.clone());

        tx.unbounded_send(Ok("a long enough first fragment".to_string())).unwrap();
        let first = filtered.next().await.unwrap().unwrap();
        assert_eq!(first, "a long enough fi");

        cancel.cancel();
        tx.unbounded_send(Ok("more".to_string())).unwrap();
        assert!(filtered.next().await.is_none());
    }
}
