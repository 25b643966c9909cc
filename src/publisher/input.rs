use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines, Stdin, Stdout,
};
use tracing::{error, info, warn};

/// One unit of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// A non-blank, trimmed name.
    Name(String),
    Stop,
}

#[async_trait]
pub trait InputSource: Send {
    /// Waits for the next input. Never returns a blank name.
    async fn next_input(&mut self) -> Input;
}

/// Prompts on `W` and reads lines from `R` until it gets a usable one.
///
/// Blank lines are rejected and re-prompted; the stop word, end of input and
/// read errors all yield `Input::Stop`.
pub struct PromptedInput<R, W> {
    lines: Lines<R>,
    out: W,
    stop_word: String,
}

impl<R, W> PromptedInput<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, out: W, stop_word: impl Into<String>) -> Self {
        Self {
            lines: reader.lines(),
            out,
            stop_word: stop_word.into(),
        }
    }

    async fn prompt(&mut self) -> std::io::Result<()> {
        let prompt = format!(
            "----\nEnter your first name (or {} to exit): ",
            self.stop_word
        );
        self.out.write_all(prompt.as_bytes()).await?;
        self.out.flush().await
    }
}

impl PromptedInput<BufReader<Stdin>, Stdout> {
    /// Reads from the process's stdin and prompts on stdout.
    pub fn stdio(stop_word: impl Into<String>) -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), stop_word)
    }
}

#[async_trait]
impl<R, W> InputSource for PromptedInput<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_input(&mut self) -> Input {
        loop {
            if let Err(e) = self.prompt().await {
                warn!(error = %e, "Failed to write prompt");
            }

            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("Input closed");
                    return Input::Stop;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    return Input::Stop;
                }
            };

            let line = line.trim();
            if line.is_empty() {
                warn!("Incorrect input, please try again");
                continue;
            }
            if line == self.stop_word {
                return Input::Stop;
            }
            return Input::Name(line.to_string());
        }
    }
}
