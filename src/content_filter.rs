//! Channel-token stripping for node output
//!
//! A legacy model family wraps its output in multi-channel control markers
//! (`<|start|>`, `<|channel|>`, `<|message|>`, `<|end|>`, `<|return|>`).
//! Only the final-channel payload is meant for the client; analysis channels
//! and role headers are dropped. Text from models that emit no markers passes
//! through untouched. `ChannelFilter` works incrementally so that markers
//! split across streaming chunk boundaries are still recognized.

#[derive(Debug, Clone, Copy, PartialEq)]
enum FilterState {
    /// No control token seen yet; everything is emitted
    Plain,
    /// Between blocks or inside a role header; suppressed
    Header,
    /// Collecting a channel name after `<|channel|>`; suppressed
    Channel,
    /// Inside a message body; emitted only for the final channel
    Body { emit: bool },
}

/// Incremental channel-marker stripper for streamed content
#[derive(Debug)]
pub struct ChannelFilter {
    buf: String,
    channel_name: String,
    state: FilterState,
}

impl Default for ChannelFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelFilter {
    pub fn new() -> Self {
        Self { buf: String::new(), channel_name: String::new(), state: FilterState::Plain }
    }

    /// Feed one chunk; returns the text that survives the filter.
    pub fn push(&mut self, input: &str) -> String {
        self.buf.push_str(input);
        let mut out = String::new();
        loop {
            match self.buf.find("<|") {
                Some(start) => {
                    let pre = self.buf[..start].to_string();
                    self.text(&pre, &mut out);
                    match self.buf[start..].find("|>") {
                        Some(rel) => {
                            let token = self.buf[start..start + rel + 2].to_string();
                            self.token(&token);
                            self.buf.drain(..start + rel + 2);
                        }
                        None => {
                            // partial control token; wait for the rest
                            self.buf.drain(..start);
                            break;
                        }
                    }
                }
                None => {
                    // a trailing '<' may begin a token in the next chunk
                    let keep = usize::from(self.buf.ends_with('<'));
                    let cut = self.buf.len() - keep;
                    let pre = self.buf[..cut].to_string();
                    self.text(&pre, &mut out);
                    self.buf.drain(..cut);
                    break;
                }
            }
        }
        out
    }

    /// Flush whatever remains at end of stream. An unterminated token is
    /// literal text when the filter is in an emitting state.
    pub fn finish(mut self) -> String {
        match self.state {
            FilterState::Plain | FilterState::Body { emit: true } => std::mem::take(&mut self.buf),
            _ => String::new(),
        }
    }

    fn text(&mut self, text: &str, out: &mut String) {
        if text.is_empty() {
            return;
        }
        match self.state {
            FilterState::Plain | FilterState::Body { emit: true } => out.push_str(text),
            FilterState::Channel => self.channel_name.push_str(text),
            _ => {}
        }
    }

    fn token(&mut self, token: &str) {
        match token {
            "<|channel|>" => {
                self.channel_name.clear();
                self.state = FilterState::Channel;
            }
            "<|message|>" => {
                let emit = self.state == FilterState::Channel
                    && self.channel_name.trim().starts_with("final");
                self.state = FilterState::Body { emit };
            }
            "<|start|>" | "<|end|>" | "<|return|>" | "<|call|>" => {
                self.state = FilterState::Header;
            }
            // unknown control tokens (e.g. <|constrain|>) end a channel name
            // but carry no state of their own
            _ => {}
        }
    }
}

/// Strip channel markers from a complete body.
pub fn strip_channel_markers(text: &str) -> String {
    let mut filter = ChannelFilter::new();
    let mut out = filter.push(text);
    out.push_str(&filter.finish());
    out
}
