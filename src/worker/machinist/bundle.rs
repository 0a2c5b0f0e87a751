use std::io::Write;
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
	#[error("io: {0}")]
	Io(#[from] std::io::Error),
	#[error("bundle is {size} bytes, ceiling is {limit}")]
	TooLarge { size: u64, limit: u64 },
}

#[derive(Debug, Clone)]
pub struct Bundle {
	pub data: Vec<u8>,
	pub sha256: String,
	pub file_count: usize,
}

/// Packs a working directory into a gzip tarball with portable, byte-
/// stable output: entries sorted by path, zeroed timestamps and ownership,
/// fixed permissions.
pub fn pack(dir: &Path, max_bytes: u64) -> Result<Bundle, BundleError> {
	let mut paths = collect_files(dir, dir)?;
	paths.sort();

	let gz = GzEncoder::new(Vec::new(), Compression::default());
	let mut tar = tar::Builder::new(gz);

	for relative in &paths {
		let full = dir.join(relative);
		let data = std::fs::read(&full)?;

		let mut header = tar::Header::new_gnu();
		header.set_size(data.len() as u64);
		header.set_mode(0o644);
		header.set_mtime(0);
		header.set_uid(0);
		header.set_gid(0);
		header.set_cksum();

		tar.append_data(&mut header, relative, data.as_slice())?;
	}

	let gz = tar.into_inner()?;
	let data = gz.finish()?;

	if data.len() as u64 > max_bytes {
		return Err(BundleError::TooLarge {
			size: data.len() as u64,
			limit: max_bytes,
		});
	}

	let sha256 = hex::encode(Sha256::digest(&data));

	Ok(Bundle {
		data,
		sha256,
		file_count: paths.len(),
	})
}

fn collect_files(root: &Path, dir: &Path) -> Result<Vec<std::path::PathBuf>, BundleError> {
	let mut paths = Vec::new();

	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let path = entry.path();
		if path.is_dir() {
			paths.extend(collect_files(root, &path)?);
		} else {
			let relative = path.strip_prefix(root).expect("path under root").to_path_buf();
			paths.push(relative);
		}
	}

	Ok(paths)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn fixture_dir() -> tempfile::TempDir {
		let dir = tempfile::tempdir().expect("tempdir");
		std::fs::write(dir.path().join("b.jpg"), b"second").expect("write");
		std::fs::write(dir.path().join("a.jpg"), b"first").expect("write");
		std::fs::create_dir(dir.path().join("thumbnails")).expect("mkdir");
		std::fs::write(dir.path().join("thumbnails/thumb-small.jpg"), b"thumb").expect("write");
		dir
	}

	#[test]
	fn pack_is_byte_stable_across_runs() {
		let dir = fixture_dir();

		let first = pack(dir.path(), u64::MAX).expect("pack");
		let second = pack(dir.path(), u64::MAX).expect("pack");

		assert_eq!(first.data, second.data);
		assert_eq!(first.sha256, second.sha256);
		assert_eq!(first.file_count, 3);
	}

	#[test]
	fn pack_enforces_the_size_ceiling() {
		let dir = fixture_dir();
		let err = pack(dir.path(), 8).expect_err("must exceed");
		assert!(matches!(err, BundleError::TooLarge { limit: 8, .. }));
	}
}
