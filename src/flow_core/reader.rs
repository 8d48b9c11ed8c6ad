//! Asynchronous JSONL tail reader with file rotation detection

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::sleep;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

pub struct TailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    inode: Option<u64>,
    poll_interval: Duration,
    from_beginning: bool,
}

impl TailReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            inode: None,
            poll_interval: Duration::from_millis(100),
            from_beginning: false,
        }
    }

    /// Replay the existing contents before tailing new lines
    pub fn from_beginning(mut self, enabled: bool) -> Self {
        self.from_beginning = enabled;
        self
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Open the file; seeks to end unless replaying from the beginning
    pub async fn start(&mut self) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;

        #[cfg(unix)]
        {
            let metadata = file.metadata().await?;
            self.inode = Some(metadata.ino());
        }

        let mut reader = BufReader::new(file);
        if !self.from_beginning {
            reader.seek(SeekFrom::End(0)).await?;
        }
        self.file = Some(reader);

        log::info!("📖 Started reading: {}", self.path.display());
        Ok(())
    }

    async fn reopen_rotated(&mut self) -> std::io::Result<()> {
        // A rotated file is new content; read it from the top
        let file = File::open(&self.path).await?;
        #[cfg(unix)]
        {
            let metadata = file.metadata().await?;
            self.inode = Some(metadata.ino());
        }
        self.file = Some(BufReader::new(file));
        Ok(())
    }

    /// Read the next non-empty line, waiting if necessary
    pub async fn read_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if self.detect_rotation().await? {
                log::info!("🔄 File rotation detected, reopening: {}", self.path.display());
                self.reopen_rotated().await?;
            }

            if let Some(ref mut reader) = self.file {
                let mut line = String::new();
                match reader.read_line(&mut line).await? {
                    0 => {
                        sleep(self.poll_interval).await;
                        continue;
                    }
                    _ => {
                        if !line.trim().is_empty() {
                            return Ok(Some(line.trim().to_string()));
                        }
                        continue;
                    }
                }
            } else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "File not opened",
                ));
            }
        }
    }

    /// Detect if the file has been rotated (inode changed)
    async fn detect_rotation(&self) -> std::io::Result<bool> {
        #[cfg(unix)]
        {
            match tokio::fs::metadata(&self.path).await {
                Ok(metadata) => Ok(self.inode.map_or(false, |old| old != metadata.ino())),
                // Mid-rotation: keep reading the old handle until the new file appears
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e),
            }
        }

        #[cfg(not(unix))]
        {
            Ok(false)
        }
    }
}
