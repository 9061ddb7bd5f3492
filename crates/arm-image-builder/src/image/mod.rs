//! Opens a downloaded image as one byte stream, whatever it was packed in.

pub mod types;

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;

use crate::error::{Error, Result};

pub use types::{ImageType, looks_like_image};

const ZIP_CHUNK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Zip,
    Xz,
    Gzip,
    Bzip2,
    Raw,
}

impl Container {
    /// Identifies the container from the first bytes of the file.
    pub fn sniff(head: &[u8]) -> Self {
        if head.starts_with(b"PK\x03\x04") {
            Container::Zip
        } else if head.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Container::Xz
        } else if head.starts_with(&[0x1f, 0x8b]) {
            Container::Gzip
        } else if head.starts_with(b"BZh") {
            Container::Bzip2
        } else {
            Container::Raw
        }
    }

    // Streaming decompressor preferred over the in-process one.
    fn external_tool(self) -> Option<&'static str> {
        match self {
            Container::Zip => Some("unzip"),
            Container::Xz => Some("xzcat"),
            Container::Gzip => Some("zcat"),
            Container::Bzip2 => Some("bzcat"),
            Container::Raw => None,
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Container::Zip => "zip",
            Container::Xz => "xz",
            Container::Gzip => "gzip",
            Container::Bzip2 => "bzip2",
            Container::Raw => "raw",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageOpener {
    pub prefer_external_tools: bool,
}

impl Default for ImageOpener {
    fn default() -> Self {
        Self {
            prefer_external_tools: true,
        }
    }
}

/// A readable image. Owns whatever produces the bytes (file, decompressor
/// process or unzip thread); [`close`](Self::close) waits for it to finish.
pub struct OpenedImage {
    reader: Box<dyn Read + Send>,
    container: Container,
    size_estimate: u64,
    child: Option<(String, Child)>,
    worker: Option<JoinHandle<()>>,
}

impl fmt::Debug for OpenedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedImage")
            .field("container", &self.container)
            .field("size_estimate", &self.size_estimate)
            .finish()
    }
}

impl OpenedImage {
    pub fn container(&self) -> Container {
        self.container
    }

    /// Uncompressed size when cheaply known, otherwise 0.
    pub fn size_estimate(&self) -> u64 {
        self.size_estimate
    }

    pub fn close(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        // Drop the read side first so a decompressor that is still writing
        // sees EPIPE instead of blocking forever.
        self.reader = Box::new(io::empty());
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| Error::msg("unzip thread panicked"))?;
        }
        if let Some((tool, mut child)) = self.child.take() {
            let status = child
                .wait()
                .map_err(|e| Error::msg(format!("failed to wait for {tool}: {e}")))?;
            if !status.success() {
                return Err(Error::msg(format!("{tool} exited with {status}")));
            }
        }
        Ok(())
    }
}

impl Read for OpenedImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        // A decompressor that dies on a corrupt archive just closes its pipe,
        // so end of stream is only real once it exited cleanly.
        if n == 0 && !buf.is_empty() {
            self.finish().map_err(io::Error::other)?;
        }
        Ok(n)
    }
}

impl Drop for OpenedImage {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::debug!("closing image stream: {e}");
        }
    }
}

impl ImageOpener {
    pub fn open(&self, path: &Path) -> Result<OpenedImage> {
        let mut file = File::open(path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
        let container = sniff_file(&mut file, path)?;
        tracing::info!(path = %path.display(), %container, "opening image");

        if container == Container::Raw {
            let size = file
                .metadata()
                .map_err(|e| Error::msg(format!("failed to stat {}: {e}", path.display())))?
                .len();
            return Ok(OpenedImage {
                reader: Box::new(file),
                container,
                size_estimate: size,
                child: None,
                worker: None,
            });
        }

        if container == Container::Zip {
            return self.open_zip(file, path);
        }

        if self.prefer_external_tools {
            if let Some(tool) = container.external_tool().and_then(|t| which::which(t).ok()) {
                match spawn_decompressor(&tool, Stdio::from(file.try_clone()?), &[]) {
                    Ok((stdout, child)) => {
                        return Ok(OpenedImage {
                            reader: Box::new(stdout),
                            container,
                            size_estimate: 0,
                            child: Some((tool.display().to_string(), child)),
                            worker: None,
                        });
                    }
                    Err(e) => tracing::warn!("{e}; falling back to in-process {container}"),
                }
            }
        }

        let buffered = BufReader::new(file);
        let reader: Box<dyn Read + Send> = match container {
            Container::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(buffered)),
            Container::Gzip => Box::new(flate2::read::MultiGzDecoder::new(buffered)),
            Container::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(buffered)),
            Container::Zip | Container::Raw => {
                return Err(Error::msg(format!("no stream decoder for {container}")));
            }
        };
        Ok(OpenedImage {
            reader,
            container,
            size_estimate: 0,
            child: None,
            worker: None,
        })
    }

    fn open_zip(&self, file: File, path: &Path) -> Result<OpenedImage> {
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| Error::msg(format!("failed to read zip {}: {e}", path.display())))?;
        if archive.len() != 1 {
            return Err(Error::msg(format!(
                "zip {} has {} entries; only archives holding exactly one image are supported",
                path.display(),
                archive.len()
            )));
        }
        let (name, size) = {
            let entry = archive
                .by_index(0)
                .map_err(|e| Error::msg(format!("failed to read zip {}: {e}", path.display())))?;
            (entry.name().to_string(), entry.size())
        };
        tracing::info!(entry = %name, size, "unzipping");

        if self.prefer_external_tools {
            if let Ok(tool) = which::which("unzip") {
                let args = [
                    PathBuf::from("-p"),
                    path.to_path_buf(),
                    PathBuf::from(&name),
                ];
                match spawn_decompressor(&tool, Stdio::null(), &args) {
                    Ok((stdout, child)) => {
                        return Ok(OpenedImage {
                            reader: Box::new(stdout),
                            container: Container::Zip,
                            size_estimate: size,
                            child: Some(("unzip".into(), child)),
                            worker: None,
                        });
                    }
                    Err(e) => tracing::warn!("{e}; falling back to in-process unzip"),
                }
            }
        }

        // ZipFile borrows the archive, so the entry is inflated on a thread
        // and handed over in chunks.
        let (tx, rx) = mpsc::sync_channel::<io::Result<Vec<u8>>>(4);
        let worker = std::thread::spawn(move || {
            let mut entry = match archive.by_index(0) {
                Ok(e) => e,
                Err(e) => {
                    let _ = tx.send(Err(io::Error::other(e)));
                    return;
                }
            };
            loop {
                let mut chunk = vec![0u8; ZIP_CHUNK];
                match entry.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => {
                        chunk.truncate(n);
                        if tx.send(Ok(chunk)).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        });

        Ok(OpenedImage {
            reader: Box::new(ChunkReader {
                rx,
                chunk: Vec::new(),
                pos: 0,
            }),
            container: Container::Zip,
            size_estimate: size,
            child: None,
            worker: Some(worker),
        })
    }
}

fn sniff_file(file: &mut File, path: &Path) -> Result<Container> {
    let mut head = [0u8; 8];
    let mut filled = 0;
    while filled < head.len() {
        let n = file
            .read(&mut head[filled..])
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    file.seek(SeekFrom::Start(0))
        .map_err(|e| Error::msg(format!("failed to rewind {}: {e}", path.display())))?;
    Ok(Container::sniff(&head[..filled]))
}

fn spawn_decompressor(
    tool: &Path,
    stdin: Stdio,
    args: &[PathBuf],
) -> Result<(ChildStdout, Child)> {
    let mut child = Command::new(tool)
        .args(args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to start {}: {e}", tool.display())))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::msg(format!("{} has no stdout pipe", tool.display())))?;
    Ok((stdout, child))
}

struct ChunkReader {
    rx: mpsc::Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => return Err(e),
                // Sender gone: the entry is fully read.
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
