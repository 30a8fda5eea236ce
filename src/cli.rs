use crate::display::{short_id, ProgressDisplay};
use crate::error::DownloadError;
use crate::registry::DownloadRegistry;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use url::Url;

const HELP: &str = "commands: list | pause <id> | resume <id> | stop <id> | retry <id> | quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Pause(String),
    Resume(String),
    Stop(String),
    Retry(String),
    Quit,
    Help,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let verb = words.next().unwrap_or_default().to_lowercase();
        let target = words.next().map(str::to_string);

        match (verb.as_str(), target) {
            ("list" | "ls", None) => Ok(Command::List),
            ("quit" | "exit" | "q", None) => Ok(Command::Quit),
            ("help" | "?", None) => Ok(Command::Help),
            ("pause", Some(id)) => Ok(Command::Pause(id)),
            ("resume", Some(id)) => Ok(Command::Resume(id)),
            ("stop", Some(id)) => Ok(Command::Stop(id)),
            ("retry", Some(id)) => Ok(Command::Retry(id)),
            ("pause" | "resume" | "stop" | "retry", None) => {
                Err(format!("{} needs a job id", verb))
            }
            _ => Err(format!("Unknown command: {}", s.trim())),
        }
    }
}

/// Reads commands from stdin and applies them to the registry.
pub struct InteractiveMode {
    registry: Arc<DownloadRegistry>,
    display: Arc<ProgressDisplay>,
}

impl InteractiveMode {
    pub fn new(registry: Arc<DownloadRegistry>, display: Arc<ProgressDisplay>) -> Self {
        Self { registry, display }
    }

    /// Returns on `quit` or when stdin closes.
    pub async fn run(&self) {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[Cli] stdin closed: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match line.parse::<Command>() {
                Ok(Command::Quit) => break,
                Ok(command) => {
                    if let Err(e) = self.apply(command).await {
                        self.display.println(format!("error: {}", e));
                    }
                }
                Err(e) => self.display.println(format!("{} ({})", e, HELP)),
            }
        }
    }

    pub async fn apply(&self, command: Command) -> Result<(), DownloadError> {
        match command {
            Command::List => {
                for job in self.registry.snapshots().await {
                    self.display.println(format!(
                        "{:<10} {:<12} {:>6.1}%  {}",
                        short_id(&job.id),
                        job.status.to_string(),
                        job.progress() * 100.0,
                        job.file_name()
                    ));
                }
            }
            Command::Pause(id) => self.registry.pause(&self.resolve(&id).await?).await?,
            Command::Resume(id) => self.registry.resume(&self.resolve(&id).await?).await?,
            Command::Stop(id) => self.registry.stop(&self.resolve(&id).await?).await?,
            Command::Retry(id) => self.registry.retry(&self.resolve(&id).await?).await?,
            Command::Help => self.display.println(HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    /// Accepts a full id or any unambiguous prefix of one.
    async fn resolve(&self, fragment: &str) -> Result<String, DownloadError> {
        if self.registry.get(fragment).is_some() {
            return Ok(fragment.to_string());
        }
        let matches: Vec<String> = self
            .registry
            .jobs()
            .await
            .iter()
            .map(|m| m.id().to_string())
            .filter(|id| id.starts_with(fragment))
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(DownloadError::JobNotFound(fragment.to_string())),
        }
    }
}

/// Default file name for a URL: its last non-empty path segment.
pub fn file_name_from_url(url: &str) -> Result<String, DownloadError> {
    let parsed = Url::parse(url)?;
    let name = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| s.to_string())
        .unwrap_or_else(|| parsed.host_str().unwrap_or("download").to_string());
    Ok(name)
}
