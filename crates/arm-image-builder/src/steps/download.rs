use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use arm_image_builder_macros::Step;
use sha2::{Digest, Sha256, Sha512};

use crate::config::Checksum;
use crate::error::{Error, Result};
use crate::executor::ExecCtx;
use crate::pipeline::{BuildState, Step};
use crate::progress::copy_with_progress;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const REPORT_EVERY: Duration = Duration::from_secs(5);

/// Fetches the source image from the first `iso_urls` entry that works.
#[Step(id = "source.download", label = "Downloading source image", privileged = false)]
#[derive(Debug, Default)]
pub struct DownloadStep;

impl Step for DownloadStep {
    fn run(&mut self, state: &mut BuildState, ctx: &ExecCtx) -> Result<()> {
        let mut failures = Vec::new();
        let urls = state.config.iso_urls.clone();
        for url in &urls {
            ctx.check_cancelled()?;
            match fetch(url, state.config.checksum(), state.config.cache_dir(), ctx) {
                Ok(path) => {
                    tracing::info!(%url, path = %path.display(), "source image ready");
                    state.iso_path = Some(path);
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!(%url, "download failed: {e}");
                    ctx.ui.error(&format!("{url}: {e}"));
                    failures.push(format!("{url}: {e}"));
                }
            }
        }
        Err(Error::msg(format!(
            "no usable source image ({})",
            failures.join("; ")
        )))
    }
}

fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if url.contains("://") {
        return None;
    }
    Some(PathBuf::from(url))
}

fn file_name_of(url: &str) -> &str {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

fn cache_name(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

fn fetch(url: &str, checksum: &Checksum, cache_dir: &Path, ctx: &ExecCtx) -> Result<PathBuf> {
    if let Some(path) = local_path(url) {
        if !path.is_file() {
            return Err(Error::msg(format!("{} does not exist", path.display())));
        }
        ctx.ui.message(&format!("using local image {}", path.display()));
        verify(&path, checksum, url)?;
        return Ok(path);
    }

    fs::create_dir_all(cache_dir)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", cache_dir.display())))?;
    let target = cache_dir.join(cache_name(url));
    if target.is_file() {
        match verify(&target, checksum, url) {
            Ok(()) if !matches!(checksum, Checksum::None) => {
                ctx.ui.message(&format!("using cached {}", target.display()));
                return Ok(target);
            }
            Ok(()) => {}
            Err(e) => tracing::debug!("cached copy rejected: {e}"),
        }
    }

    let part = target.with_extension("part");
    ctx.ui.message(&format!("downloading {url}"));
    let client = http_client()?;
    let res = client
        .get(url)
        .send()
        .map_err(|e| Error::msg(format!("HTTP request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::msg(format!(
            "HTTP download failed with status {}",
            res.status()
        )));
    }
    let total = res.content_length().unwrap_or(0);
    let out = fs::File::create(&part)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", part.display())))?;
    let ui = ctx.ui.clone();
    let copied = copy_with_progress(res, out, total, &ctx.cancel, REPORT_EVERY, |s| {
        ui.message(&format!("downloaded {s}"))
    });
    let (_, out) = match copied {
        Ok(v) => v,
        Err(e) => {
            let _ = fs::remove_file(&part);
            return Err(e);
        }
    };
    out.sync_all()
        .map_err(|e| Error::msg(format!("failed to sync {}: {e}", part.display())))?;
    drop(out);

    if let Err(e) = verify(&part, checksum, url) {
        let _ = fs::remove_file(&part);
        return Err(e);
    }
    fs::rename(&part, &target).map_err(|e| {
        Error::msg(format!(
            "failed to move {} to {}: {e}",
            part.display(),
            target.display()
        ))
    })?;
    Ok(target)
}

fn http_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::msg(format!("failed to build HTTP client: {e}")))
}

fn verify(path: &Path, checksum: &Checksum, url: &str) -> Result<()> {
    let expected = match checksum {
        Checksum::None => return Ok(()),
        Checksum::Sha256(h) | Checksum::Sha512(h) => h.clone(),
        Checksum::File(list) => {
            let body = read_checksum_list(list)?;
            find_in_checksum_list(&body, file_name_of(url)).ok_or_else(|| {
                Error::msg(format!("{} is not listed in {list}", file_name_of(url)))
            })?
        }
    };
    let actual = match expected.len() {
        64 => hash_file::<Sha256>(path)?,
        128 => hash_file::<Sha512>(path)?,
        n => return Err(Error::msg(format!("unsupported checksum length {n}"))),
    };
    if actual != expected {
        return Err(Error::msg(format!(
            "checksum mismatch for {}: expected {expected}, got {actual}",
            path.display()
        )));
    }
    tracing::debug!(path = %path.display(), "checksum ok");
    Ok(())
}

fn read_checksum_list(list: &str) -> Result<String> {
    if let Some(path) = local_path(list) {
        return fs::read_to_string(&path)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())));
    }
    let res = http_client()?
        .get(list)
        .send()
        .map_err(|e| Error::msg(format!("HTTP request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(Error::msg(format!(
            "checksum list download failed with status {}",
            res.status()
        )));
    }
    res.text()
        .map_err(|e| Error::msg(format!("failed to read checksum list: {e}")))
}

/// Looks up `file_name` in a `sha256sum`-style (`<hex>  [*]<name>`) or
/// BSD-style (`SHA256 (<name>) = <hex>`) checksum list.
pub fn find_in_checksum_list(body: &str, file_name: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((lhs, hex)) = line.split_once(") = ") {
            let name = lhs.split_once(" (").map(|(_, n)| n).unwrap_or_default();
            if name == file_name {
                return Some(hex.trim().to_ascii_lowercase());
            }
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hex), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        let name = name.trim_start_matches('*');
        if name == file_name || name.rsplit('/').next() == Some(file_name) {
            return Some(hex.to_ascii_lowercase());
        }
    }
    None
}

fn hash_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; 1024 * 256];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NullUi;
    use std::sync::Arc;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn checksum_lists_in_both_styles() {
        let gnu = "# comment\n\
                   0123abcd  other.img.xz\n\
                   DEADBEEF *2024-raspios-lite.img.xz\n";
        assert_eq!(
            find_in_checksum_list(gnu, "2024-raspios-lite.img.xz").as_deref(),
            Some("deadbeef")
        );
        let bsd = "SHA256 (kali.img.xz) = ABCDEF\nSHA256 (other) = 00\n";
        assert_eq!(find_in_checksum_list(bsd, "kali.img.xz").as_deref(), Some("abcdef"));
        assert_eq!(find_in_checksum_list(bsd, "missing.img"), None);
    }

    #[test]
    fn file_names_ignore_query_strings() {
        assert_eq!(file_name_of("https://h/x/raspios.img.xz?dl=1"), "raspios.img.xz");
        assert_eq!(local_path("file:///srv/a.img"), Some(PathBuf::from("/srv/a.img")));
        assert_eq!(local_path("https://h/a.img"), None);
    }

    #[test]
    fn local_images_are_used_in_place_after_verification() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let img = tmp.path().join("empty.img");
        fs::write(&img, b"").unwrap();
        let ctx = ExecCtx::new(Arc::new(NullUi));
        let url = img.display().to_string();

        let got = fetch(&url, &Checksum::Sha256(EMPTY_SHA256.into()), tmp.path(), &ctx).unwrap();
        assert_eq!(got, img);

        let bad = Checksum::Sha256("0".repeat(64));
        let err = fetch(&url, &bad, tmp.path(), &ctx).unwrap_err().to_string();
        assert!(err.contains("checksum mismatch"), "unexpected err: {err}");
    }

    #[test]
    fn checksum_file_is_matched_by_name() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let img = tmp.path().join("empty.img");
        fs::write(&img, b"").unwrap();
        let list = tmp.path().join("SHA256SUMS");
        fs::write(&list, format!("{EMPTY_SHA256}  empty.img\n")).unwrap();
        let url = format!("file://{}", img.display());
        verify(&img, &Checksum::File(list.display().to_string()), &url).unwrap();
    }

    #[test]
    fn download_step_reports_every_failed_url() {
        let mut state = BuildState::default();
        state.config.iso_urls = vec!["/nonexistent/a.img".into(), "/nonexistent/b.img".into()];
        let ctx = ExecCtx::new(Arc::new(NullUi));
        let err = DownloadStep.run(&mut state, &ctx).unwrap_err().to_string();
        assert!(err.contains("a.img") && err.contains("b.img"), "unexpected err: {err}");
        assert!(state.iso_path.is_none());
    }
}
