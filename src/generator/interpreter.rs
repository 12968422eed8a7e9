use std::fmt;
use std::io;
use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::generator::transport::LineTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Limit,
    Input,
    Answer,
}

impl FromStr for BlockKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "limit" => Ok(Self::Limit),
            "input" => Ok(Self::Input),
            "answer" => Ok(Self::Answer),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Limit => "limit",
            Self::Input => "input",
            Self::Answer => "answer",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Confirm(String),
    Ask(String),
    Info(String),
    Warn(String),
    Error(String),
    EnterResultMode,
    ConfigQuery(String),
    ResultBlock(BlockKey, Vec<String>),
}

impl ProtocolEvent {
    pub fn expects_reply(&self) -> bool {
        matches!(self, Self::Confirm(_) | Self::Ask(_) | Self::ConfigQuery(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed block header `{0}`, expected `<key> <line count>`")]
    MalformedHeader(String),
    #[error("unknown block key `{0}`")]
    UnknownKey(String),
    #[error("negative line count in header `{0}`")]
    NegativeCount(String),
    #[error("invalid line count in header `{0}`")]
    InvalidCount(String),
    #[error("`{key}` block declared {expected} lines but the stream ended after {received}")]
    TruncatedBlock {
        key: BlockKey,
        expected: usize,
        received: usize,
    },
    #[error("a reply is pending, answer the last request before reading on")]
    ReplyPending,
    #[error("no request is waiting for a reply")]
    NoReplyExpected,
    #[error("generator closed its input before the reply was written")]
    Closed(#[source] io::Error),
    #[error("failed to read generator output")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Normal,
    /// Terminal: nothing leads back to `Normal`.
    ResultMode,
}

/// Turns a generator's output into [`ProtocolEvent`]s.
///
/// Every `Confirm`, `Ask` and `ConfigQuery` event must be answered through
/// [`reply`](Self::reply) (or [`reply_confirm`](Self::reply_confirm)) before
/// the next call to [`next_event`](Self::next_event).
#[derive(Debug)]
pub struct ProtocolInterpreter<R, W> {
    transport: LineTransport<R, W>,
    state: State,
    awaiting_reply: bool,
}

impl<R, W> ProtocolInterpreter<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(transport: LineTransport<R, W>) -> Self {
        Self {
            transport,
            state: State::Normal,
            awaiting_reply: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Next event, or `None` once the generator's output has ended.
    pub async fn next_event(&mut self) -> Result<Option<ProtocolEvent>, ProtocolError> {
        if self.awaiting_reply {
            return Err(ProtocolError::ReplyPending);
        }
        match self.state {
            State::Normal => self.next_command().await,
            State::ResultMode => self.next_block().await,
        }
    }

    pub async fn reply(&mut self, line: &str) -> Result<(), ProtocolError> {
        if !self.awaiting_reply {
            return Err(ProtocolError::NoReplyExpected);
        }
        self.awaiting_reply = false;
        self.transport
            .write_line(line)
            .await
            .map_err(ProtocolError::Closed)
    }

    pub async fn reply_confirm(&mut self, accepted: bool) -> Result<(), ProtocolError> {
        self.reply(if accepted { "1" } else { "0" }).await
    }

    /// Closes the generator's input; later replies fail with `Closed`.
    pub async fn close_input(&mut self) -> io::Result<()> {
        self.transport.close_input().await
    }

    async fn next_command(&mut self) -> Result<Option<ProtocolEvent>, ProtocolError> {
        let Some(line) = self.transport.next_line().await? else {
            return Ok(None);
        };
        let event = parse_command(&line);
        match &event {
            ProtocolEvent::EnterResultMode => self.state = State::ResultMode,
            event if event.expects_reply() => self.awaiting_reply = true,
            _ => {}
        }
        Ok(Some(event))
    }

    async fn next_block(&mut self) -> Result<Option<ProtocolEvent>, ProtocolError> {
        let header = loop {
            match self.transport.next_line().await? {
                None => return Ok(None),
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
            }
        };
        let (key, expected) = parse_header(&header)?;

        let mut content = Vec::with_capacity(expected.min(1024));
        while content.len() < expected {
            match self.transport.next_line().await? {
                Some(line) => content.push(line),
                None => {
                    return Err(ProtocolError::TruncatedBlock {
                        key,
                        expected,
                        received: content.len(),
                    });
                }
            }
        }
        Ok(Some(ProtocolEvent::ResultBlock(key, content)))
    }
}

/// Classifies one line read in `Normal` state.
pub fn parse_command(line: &str) -> ProtocolEvent {
    let Some(rest) = line.trim().strip_prefix('/') else {
        return ProtocolEvent::Info(line.to_string());
    };
    let mut parts = rest.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let content = parts.next().map(str::trim).unwrap_or_default().to_string();

    match command {
        "confirm" => ProtocolEvent::Confirm(content),
        "ask" => ProtocolEvent::Ask(content),
        "info" => ProtocolEvent::Info(content),
        "warn" => ProtocolEvent::Warn(content),
        "error" => ProtocolEvent::Error(content),
        "result" => ProtocolEvent::EnterResultMode,
        "config" => ProtocolEvent::ConfigQuery(config_key(&content).to_string()),
        _ => {
            tracing::debug!(command, "unknown generator command passed through");
            ProtocolEvent::Info(line.to_string())
        }
    }
}

/// Accepts both `/config <key>` and the older `/config read <key>`.
fn config_key(content: &str) -> &str {
    match content.split_once(char::is_whitespace) {
        Some(("read", key)) => key.trim(),
        _ => content,
    }
}

/// Parses `<key> <line count>`.
pub fn parse_header(header: &str) -> Result<(BlockKey, usize), ProtocolError> {
    let parts: Vec<&str> = header.split_whitespace().collect();
    let [key, count] = parts.as_slice() else {
        return Err(ProtocolError::MalformedHeader(header.to_string()));
    };
    let key = key
        .parse::<BlockKey>()
        .map_err(|()| ProtocolError::UnknownKey(key.to_string()))?;
    let count = match count.parse::<usize>() {
        Ok(count) => count,
        Err(_) if count.parse::<i64>().is_ok_and(|n| n < 0) => {
            return Err(ProtocolError::NegativeCount(header.to_string()));
        }
        Err(_) => return Err(ProtocolError::InvalidCount(header.to_string())),
    };
    Ok((key, count))
}
