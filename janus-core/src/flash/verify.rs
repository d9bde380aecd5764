//! Verify stage: compare SHA-256 of the image against the written device.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use super::progress::{KillSignal, LogRing, StageSink, round4};

const CHUNK_SIZE: usize = 4 * 1024 * 1024;

fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hash a reader up to `limit` bytes, reporting progress over
/// `[offset, offset + span]` of the stage. Returns None when cancelled.
fn hash_reader(
    mut reader: impl Read,
    limit: u64,
    total: u64,
    offset: f64,
    sink: &StageSink,
    kill: &KillSignal,
) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut read_so_far: u64 = 0;
    while read_so_far < limit {
        if kill.is_raised() {
            return None;
        }
        let want = CHUNK_SIZE.min((limit - read_so_far) as usize);
        let n = reader.read(&mut chunk[..want]).ok()?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        read_so_far += n as u64;
        sink.progress(round4(offset + read_so_far as f64 / (total as f64 * 2.0)));
    }
    Some(hex_digest(&hasher.finalize()))
}

/// Compare SHA-256 of `image` with the first `image-size` bytes of `device`.
///
/// Progress scales 0→0.5 across the image hash and 0.5→1.0 across the device
/// hash. Returns true iff the digests match.
pub fn verify_image(
    image: &Path,
    device: &str,
    sink: &StageSink,
    log: &LogRing,
    kill: &KillSignal,
) -> bool {
    let img_size = match std::fs::metadata(image) {
        Ok(meta) => meta.len(),
        Err(err) => {
            log.push(format!("ERROR: cannot stat image: {err}"));
            return false;
        }
    };
    if img_size == 0 {
        log.push("WARN: image size is 0, skipping verify".to_string());
        return true;
    }

    log.push("Verifying: computing SHA-256 of image ...".to_string());
    sink.progress(0.0);

    let image_file = match File::open(image) {
        Ok(f) => f,
        Err(err) => {
            log.push(format!("ERROR: cannot open image: {err}"));
            return false;
        }
    };
    let Some(hex_img) = hash_reader(image_file, img_size, img_size, 0.0, sink, kill) else {
        log.push("CANCELLED during verify".to_string());
        return false;
    };
    log.push(format!("Image SHA-256: {hex_img}"));

    log.push("Verifying: computing SHA-256 of device ...".to_string());
    let device_file = match File::open(device) {
        Ok(f) => f,
        Err(err) => {
            log.push(format!("ERROR: cannot open device: {err}"));
            return false;
        }
    };
    let Some(hex_dev) = hash_reader(device_file, img_size, img_size, 0.5, sink, kill) else {
        log.push("CANCELLED during verify (device read)".to_string());
        return false;
    };
    log.push(format!("Device SHA-256: {hex_dev}"));

    if hex_img == hex_dev {
        log.push("Verify OK".to_string());
        sink.progress(1.0);
        true
    } else {
        log.push("Verify FAILED - checksums do not match!".to_string());
        false
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn sink() -> StageSink {
        let (sink, _rx) = StageSink::channel();
        sink
    }

    #[test]
    fn matching_content_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        let device = dir.path().join("sdx");
        std::fs::write(&image, b"janus test payload").unwrap();
        std::fs::write(&device, b"janus test payload").unwrap();

        let log = LogRing::default();
        let ok = verify_image(
            &image,
            device.to_str().unwrap(),
            &sink(),
            &log,
            &KillSignal::new(),
        );
        assert!(ok);
        assert!(log.snapshot().iter().any(|l| l == "Verify OK"));
    }

    #[test]
    fn device_longer_than_image_still_verifies() {
        // Only the first image-size bytes of the device are hashed.
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        let device = dir.path().join("sdx");
        std::fs::write(&image, b"payload").unwrap();
        let mut f = File::create(&device).unwrap();
        f.write_all(b"payload plus trailing garbage").unwrap();

        let log = LogRing::default();
        assert!(verify_image(
            &image,
            device.to_str().unwrap(),
            &sink(),
            &log,
            &KillSignal::new(),
        ));
    }

    #[test]
    fn mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        let device = dir.path().join("sdx");
        std::fs::write(&image, b"expected bytes").unwrap();
        std::fs::write(&device, b"different bytes").unwrap();

        let log = LogRing::default();
        let ok = verify_image(
            &image,
            device.to_str().unwrap(),
            &sink(),
            &log,
            &KillSignal::new(),
        );
        assert!(!ok);
        assert!(
            log.snapshot()
                .iter()
                .any(|l| l.contains("Verify FAILED"))
        );
    }

    #[test]
    fn empty_image_is_a_warning_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("empty.img");
        std::fs::write(&image, b"").unwrap();

        let log = LogRing::default();
        assert!(verify_image(
            &image,
            "/nonexistent",
            &sink(),
            &log,
            &KillSignal::new(),
        ));
    }

    #[test]
    fn raised_kill_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("os.img");
        let device = dir.path().join("sdx");
        std::fs::write(&image, b"data").unwrap();
        std::fs::write(&device, b"data").unwrap();

        let kill = KillSignal::new();
        kill.raise();
        let log = LogRing::default();
        assert!(!verify_image(
            &image,
            device.to_str().unwrap(),
            &sink(),
            &log,
            &kill,
        ));
    }
}
