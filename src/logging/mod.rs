use std::io::{self, Write};

use async_trait::async_trait;
use env_logger::Builder;
use log::LevelFilter;
use pingora::{
    server::{ListenFds, ShutdownWatch},
    services::Service,
};
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
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

/// Drives stderr/human logging through `env_logger` at the configured
/// level, and separately owns an async file-backed access log: one line
/// per completed request (method, URI, status, cache verdict, upstream
/// address, duration), written through [`Logger::log_access`] from the
/// request pipeline's completion point.
pub struct Logger {
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
    config: config::LogConfig,
}

impl Logger {
    pub fn new(config: config::LogConfig) -> Self {
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

    /// Initializes the global `log` facade for stderr/human output, at the
    /// level named in configuration (falling back to `info` on a bad value,
    /// same lenience `env_logger` itself shows for `RUST_LOG`).
    pub fn init_env_logger(&self) {
        let level = self.config.level.parse().unwrap_or(LevelFilter::Info);
        Builder::from_env(env_logger::Env::default())
            .filter(None, level)
            .init();
    }

    /// Queues one completed-request line for the background access-log
    /// writer. Never blocks the request path; a closed channel (writer
    /// already shut down) silently drops the line.
    pub fn log_access(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        let _ = self.sender.send(data);
    }

    pub fn access_log_writer(&self) -> AsyncWriter {
        self.create_async_writer()
    }

    /// A cheap, cloneable handle request-handling code can hold onto without
    /// owning the receiver end (and therefore without needing to be the same
    /// value registered as a `Service`).
    pub fn handle(&self) -> AccessLogHandle {
        AccessLogHandle {
            sender: self.sender.clone(),
        }
    }
}

/// Sender-only handle to a [`Logger`]'s access-log channel. The `Logger`
/// itself is registered as a `Service` so its background writer task runs;
/// this handle is what request-handling code actually logs through.
#[derive(Clone)]
pub struct AccessLogHandle {
    sender: UnboundedSender<Vec<u8>>,
}

impl AccessLogHandle {
    pub fn log_access(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        let _ = self.sender.send(data);
    }
}

#[async_trait]
impl Service for Logger {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let log_file_path = &self.config.access_log_path;

        if let Some(parent) = std::path::Path::new(log_file_path).parent() {
            if metadata(parent).await.is_err() {
                create_dir_all(parent)
                    .await
                    .expect("Failed to create log path")
            }
        }

        let mut file = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .append(true)
                .create(true)
                .open(log_file_path)
                .await
                .expect("Failed to open or create log file"),
        );

        loop {
            tokio::select! {
                biased;
                // Shutdown signal handling
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("Shutdown signal received, stopping write log");
                        break;
                    }
                },

                data = self.receiver.recv() => {
                    match data {
                        Some(data) => {
                            if let Err(e) = file.write_all(&data).await {
                                log::error!("Failed to write to log file: {}", e);
                            }
                        }
                        None => {
                            log::info!("Log channel closed, stopping write log");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(e) = file.flush().await {
            log::error!("Failed to flush log file: {}", e);
        }
    }

    fn name(&self) -> &'static str {
        "access log sync"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}
