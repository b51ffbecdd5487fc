//! Streaming LLM output segmentation.
//!
//! [`SentenceSegmenter`] cuts a token stream into TTS-ready sentences on
//! sentence-final punctuation, a maximum character budget, or stream end,
//! and detects the structured tool-call envelope. [`ThinkFilter`] removes
//! `<think>…</think>` spans before tokens are surfaced; it is applied at
//! the provider boundary so hidden reasoning never reaches the segmenter,
//! TTS, or dialogue history.

use serde::Deserialize;

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Sentence-final punctuation (CJK and ASCII).
const SENTENCE_END: [char; 6] = ['。', '！', '？', '.', '!', '?'];

/// Strips `<think>…</think>` spans from a chunked text stream, including
/// tags split across chunk boundaries. An unterminated span is dropped.
#[derive(Debug, Default)]
pub struct ThinkFilter {
    in_think: bool,
    carry: String,
}

impl ThinkFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the visible text it contributes.
    pub fn push(&mut self, chunk: &str) -> String {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(chunk);
        let mut out = String::new();

        loop {
            if self.in_think {
                match text.find(THINK_CLOSE) {
                    Some(pos) => {
                        text.drain(..pos + THINK_CLOSE.len());
                        self.in_think = false;
                    }
                    None => {
                        // Hold a tail that could complete the close tag;
                        // everything before it is hidden reasoning.
                        self.carry = split_trailing_partial(&mut text, THINK_CLOSE);
                        return out;
                    }
                }
            } else {
                match text.find(THINK_OPEN) {
                    Some(pos) => {
                        out.push_str(&text[..pos]);
                        text.drain(..pos + THINK_OPEN.len());
                        self.in_think = true;
                    }
                    None => {
                        self.carry = split_trailing_partial(&mut text, THINK_OPEN);
                        out.push_str(&text);
                        return out;
                    }
                }
            }
        }
    }

    /// Flush at stream end. Text inside an unterminated span stays hidden.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        if self.in_think {
            self.in_think = false;
            String::new()
        } else {
            carry
        }
    }
}

/// Removes the longest suffix of `text` that is a proper prefix of `tag`
/// and returns it.
fn split_trailing_partial(text: &mut String, tag: &str) -> String {
    let max = tag.len().saturating_sub(1).min(text.len());
    for len in (1..=max).rev() {
        let at = text.len() - len;
        if text.is_char_boundary(at) && tag.as_bytes().starts_with(&text.as_bytes()[at..]) {
            return text.split_off(at);
        }
    }
    String::new()
}

/// A text fragment handed to TTS, ordered within its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub index: usize,
    pub text: String,
}

/// The out-of-band structured envelope an LLM emits instead of prose when
/// it wants a tool invoked.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolCallEnvelope {
    pub tool: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    Sentence(Sentence),
    ToolCall(ToolCallEnvelope),
}

#[derive(Debug)]
enum Mode {
    /// Nothing seen yet; a leading `{` switches to Json.
    Probing,
    Prose,
    Json(JsonScan),
}

#[derive(Debug, Default)]
struct JsonScan {
    buf: String,
    depth: u32,
    in_string: bool,
    escaped: bool,
}

/// State machine over Unicode scalar values cutting streamed LLM text into
/// sentences and extracting the tool-call envelope.
#[derive(Debug)]
pub struct SentenceSegmenter {
    mode: Mode,
    buf: String,
    buf_chars: usize,
    max_chars: usize,
    next_index: usize,
}

impl SentenceSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            mode: Mode::Probing,
            buf: String::new(),
            buf_chars: 0,
            max_chars: max_chars.max(8),
            next_index: 0,
        }
    }

    /// Feed one chunk of (already think-filtered) text.
    pub fn push(&mut self, chunk: &str) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        for ch in chunk.chars() {
            self.push_char(ch, &mut events);
        }
        events
    }

    /// Flush at stream end.
    pub fn finish(&mut self) -> Vec<SegmentEvent> {
        let mut events = Vec::new();
        match std::mem::replace(&mut self.mode, Mode::Prose) {
            // An unterminated envelope is treated as prose.
            Mode::Json(scan) => {
                for ch in scan.buf.chars() {
                    self.push_prose_char(ch, &mut events);
                }
            }
            Mode::Probing | Mode::Prose => {}
        }
        self.flush_sentence(&mut events);
        self.mode = Mode::Probing;
        self.next_index = 0;
        events
    }

    fn push_char(&mut self, ch: char, events: &mut Vec<SegmentEvent>) {
        if matches!(self.mode, Mode::Probing) {
            if ch.is_whitespace() {
                return;
            }
            if ch == '{' {
                let mut scan = JsonScan::default();
                scan.buf.push(ch);
                scan.depth = 1;
                self.mode = Mode::Json(scan);
                return;
            }
            self.mode = Mode::Prose;
        }

        let finished = match &mut self.mode {
            Mode::Prose => {
                self.push_prose_char(ch, events);
                return;
            }
            Mode::Json(scan) => {
                scan.buf.push(ch);
                if scan.in_string {
                    if scan.escaped {
                        scan.escaped = false;
                    } else if ch == '\\' {
                        scan.escaped = true;
                    } else if ch == '"' {
                        scan.in_string = false;
                    }
                    None
                } else {
                    match ch {
                        '"' => {
                            scan.in_string = true;
                            None
                        }
                        '{' => {
                            scan.depth += 1;
                            None
                        }
                        '}' => {
                            scan.depth -= 1;
                            if scan.depth == 0 {
                                Some(std::mem::take(&mut scan.buf))
                            } else {
                                None
                            }
                        }
                        _ => None,
                    }
                }
            }
            Mode::Probing => unreachable!("probing handled above"),
        };

        if let Some(raw) = finished {
            self.mode = Mode::Prose;
            self.finish_json(raw, events);
        }
    }

    fn finish_json(&mut self, raw: String, events: &mut Vec<SegmentEvent>) {
        match serde_json::from_str::<ToolCallEnvelope>(&raw) {
            Ok(envelope) => events.push(SegmentEvent::ToolCall(envelope)),
            // Braces that are not a tool envelope are ordinary prose.
            Err(_) => {
                for ch in raw.chars() {
                    self.push_prose_char(ch, events);
                }
            }
        }
    }

    fn push_prose_char(&mut self, ch: char, events: &mut Vec<SegmentEvent>) {
        self.buf.push(ch);
        self.buf_chars += 1;
        if SENTENCE_END.contains(&ch) || self.buf_chars >= self.max_chars {
            self.flush_sentence(events);
        }
    }

    fn flush_sentence(&mut self, events: &mut Vec<SegmentEvent>) {
        let text = std::mem::take(&mut self.buf);
        self.buf_chars = 0;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        events.push(SegmentEvent::Sentence(Sentence {
            index: self.next_index,
            text: trimmed.to_string(),
        }));
        self.next_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(events: Vec<SegmentEvent>) -> Vec<String> {
        events
            .into_iter()
            .filter_map(|e| match e {
                SegmentEvent::Sentence(s) => Some(s.text),
                SegmentEvent::ToolCall(_) => None,
            })
            .collect()
    }

    #[test]
    fn splits_on_cjk_and_ascii_punctuation() {
        let mut seg = SentenceSegmenter::new(120);
        let mut events = seg.push("你好，很高兴见到你。今天天气不错！How are you?");
        events.extend(seg.finish());
        assert_eq!(
            sentences(events),
            vec!["你好，很高兴见到你。", "今天天气不错！", "How are you?"]
        );
    }

    #[test]
    fn sentence_indices_are_monotonic() {
        let mut seg = SentenceSegmenter::new(120);
        let events = seg.push("一。二。三。");
        let indices: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::Sentence(s) => Some(s.index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn long_run_without_punctuation_hits_char_budget() {
        let mut seg = SentenceSegmenter::new(10);
        let mut events = seg.push("abcdefghij");
        events.extend(seg.push("k"));
        events.extend(seg.finish());
        let out = sentences(events);
        assert_eq!(out[0].chars().count(), 10);
        assert_eq!(out[1], "k");
    }

    #[test]
    fn stream_end_flushes_partial_sentence() {
        let mut seg = SentenceSegmenter::new(120);
        assert!(seg.push("半句话还没说完").is_empty());
        assert_eq!(sentences(seg.finish()), vec!["半句话还没说完"]);
    }

    #[test]
    fn detects_tool_call_envelope() {
        let mut seg = SentenceSegmenter::new(120);
        let mut events = seg.push(r#"{"tool":"weather","args":{"city":"北京"}}"#);
        events.extend(seg.finish());
        assert_eq!(events.len(), 1);
        match &events[0] {
            SegmentEvent::ToolCall(call) => {
                assert_eq!(call.tool, "weather");
                assert_eq!(call.args["city"], "北京");
            }
            other => panic!("expected tool call, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_split_across_tokens_is_detected() {
        let mut seg = SentenceSegmenter::new(120);
        let mut events = Vec::new();
        for chunk in [r#"{"tool":"#, r#""time","#, r#""args":{}}"#] {
            events.extend(seg.push(chunk));
        }
        events.extend(seg.finish());
        assert!(matches!(&events[0], SegmentEvent::ToolCall(c) if c.tool == "time"));
    }

    #[test]
    fn non_tool_json_degrades_to_prose() {
        let mut seg = SentenceSegmenter::new(120);
        let mut events = seg.push(r#"{"temp":"22"} 就这样。"#);
        events.extend(seg.finish());
        let out = sentences(events);
        // The braces rejoin the prose stream and ride the usual sentence cut.
        assert_eq!(out, vec![r#"{"temp":"22"} 就这样。"#]);
    }

    #[test]
    fn prose_after_leading_text_never_enters_json_mode() {
        let mut seg = SentenceSegmenter::new(120);
        let mut events = seg.push(r#"答案是 {"tool":"weather"} 哦。"#);
        events.extend(seg.finish());
        assert_eq!(sentences(events).len(), 1);
    }

    #[test]
    fn think_filter_strips_single_span() {
        let mut filter = ThinkFilter::new();
        let mut out = filter.push("<think>hidden reasoning</think>你好。");
        out.push_str(&filter.finish());
        assert_eq!(out, "你好。");
    }

    #[test]
    fn think_filter_handles_tags_split_across_chunks() {
        let mut filter = ThinkFilter::new();
        let mut out = String::new();
        for chunk in ["前<th", "ink>内部", "思考</th", "ink>后"] {
            out.push_str(&filter.push(chunk));
        }
        out.push_str(&filter.finish());
        assert_eq!(out, "前后");
    }

    #[test]
    fn think_filter_drops_unterminated_span() {
        let mut filter = ThinkFilter::new();
        let mut out = filter.push("visible<think>never closed");
        out.push_str(&filter.finish());
        assert_eq!(out, "visible");
    }

    #[test]
    fn think_filter_passes_lone_angle_bracket_through() {
        let mut filter = ThinkFilter::new();
        let mut out = filter.push("a < b");
        out.push_str(&filter.push(" and c"));
        out.push_str(&filter.finish());
        assert_eq!(out, "a < b and c");
    }
}
