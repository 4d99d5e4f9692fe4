use std::{
    io::{self, Write},
    str::FromStr,
};

use env_logger::Builder;
use log::LevelFilter;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::config;

pub struct AsyncWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for AsyncWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let data = buf.to_vec();
        self.sender
            .send(data)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Log sink writing `env_logger` output to a file from a background task.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::Log,
}

impl Logger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            sender,
            receiver,
            config,
        }
    }

    fn create_async_writer(&self) -> AsyncWriter {
        AsyncWriter {
            sender: self.sender.clone(),
        }
    }

    fn level(&self) -> LevelFilter {
        self.config
            .level
            .as_deref()
            .and_then(|l| LevelFilter::from_str(l).ok())
            .unwrap_or(LevelFilter::Info)
    }

    /// Installs the global logger, piping into this sink.
    pub fn init_env_logger(&self) {
        let writer = self.create_async_writer();
        let installed = Builder::from_env(env_logger::Env::default())
            .filter(None, self.level())
            .target(env_logger::Target::Pipe(Box::new(writer)))
            .try_init();
        if installed.is_err() {
            log::debug!("Global logger already installed");
        }
    }

    /// Drains buffered log lines into the file until `shutdown` turns true
    /// or every writer is gone.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        let log_file_path = &self.config.path;

        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if !parent.as_os_str().is_empty() && metadata(parent).await.is_err() {
                create_dir_all(parent).await?;
            }
        }

        let mut file = BufWriter::new(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(log_file_path)
                .await?,
        );

        // The logger holds a sender of its own, so the channel only closes
        // once the sink is dropped.
        drop(self.sender);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                log::error!("Failed to write to log file: {e}");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        while let Ok(data) = self.receiver.try_recv() {
            file.write_all(&data).await?;
        }
        file.flush().await
    }
}

/// A file sink draining in the background, closed by [`LogSink::close`].
pub struct LogSink {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<io::Result<()>>,
}

impl LogSink {
    /// Installs the global logger for `config`: a file sink when a log file
    /// is configured, stderr otherwise. Must be called inside a runtime.
    pub fn install(config: Option<&config::Log>) -> Option<Self> {
        match config {
            Some(log) => {
                let logger = Logger::new(log.clone());
                logger.init_env_logger();
                let (shutdown, rx) = watch::channel(false);
                let task = tokio::spawn(logger.run(rx));
                Some(Self { shutdown, task })
            }
            None => {
                init_stderr(None);
                None
            }
        }
    }

    /// Flushes buffered lines and waits for the file to be written.
    pub async fn close(self) -> io::Result<()> {
        let _ = self.shutdown.send(true);
        self.task
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
    }
}

/// Installs a plain stderr logger when no log file is configured.
pub fn init_stderr(level: Option<&str>) {
    let level = level
        .and_then(|l| LevelFilter::from_str(l).ok())
        .unwrap_or(LevelFilter::Info);
    let _ = Builder::from_env(env_logger::Env::default())
        .filter(None, level)
        .try_init();
}
