use std::io::Cursor;
use std::time::Duration;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};

/// Magic-byte classification of inputs; anything else is rejected before a
/// decoder ever sees the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
	Jpeg,
	Png,
	Tiff,
}

impl ImageKind {
	pub fn sniff(data: &[u8]) -> Option<Self> {
		if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
			Some(ImageKind::Jpeg)
		} else if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
			Some(ImageKind::Png)
		} else if data.starts_with(&[0x49, 0x49, 0x2A, 0x00]) || data.starts_with(&[0x4D, 0x4D, 0x00, 0x2A]) {
			Some(ImageKind::Tiff)
		} else {
			None
		}
	}

	pub fn mime_type(&self) -> &'static str {
		match self {
			ImageKind::Jpeg => "image/jpeg",
			ImageKind::Png => "image/png",
			ImageKind::Tiff => "image/tiff",
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
	#[error("decode: {0}")]
	Decode(image::ImageError),
	#[error("encode: {0}")]
	Encode(image::ImageError),
	#[error("codec call exceeded {0:?}")]
	Timeout(Duration),
	#[error("blocking task: {0}")]
	Join(#[from] tokio::task::JoinError),
	#[error("cannot fit image under {limit} bytes, smallest attempt was {smallest}")]
	CannotFit { limit: usize, smallest: usize },
}

#[derive(Debug, Clone)]
pub struct ImageInfo {
	pub width: u32,
	pub height: u32,
	pub bit_depth: u8,
	pub color_space: &'static str,
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
	pub data: Bytes,
	pub width: u32,
	pub height: u32,
}

/// The image-codec seam. Every call decodes and encodes on a blocking
/// thread under the caller-held codec permit and a hard timeout.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
	timeout: Duration,
}

impl Codec {
	pub fn new(timeout: Duration) -> Self {
		Self { timeout }
	}

	async fn run<T, F>(&self, f: F) -> Result<T, CodecError>
	where
		T: Send + 'static,
		F: FnOnce() -> Result<T, CodecError> + Send + 'static,
	{
		let timeout = self.timeout;
		tokio::time::timeout(timeout, tokio::task::spawn_blocking(f))
			.await
			.map_err(|_| CodecError::Timeout(timeout))??
	}

	#[tracing::instrument(skip(self, data), name = "Codec::probe", err)]
	pub async fn probe(&self, data: Bytes) -> Result<ImageInfo, CodecError> {
		self.run(move || {
			let img = image::load_from_memory(&data).map_err(CodecError::Decode)?;
			let color = img.color();
			let (width, height) = img.dimensions();
			Ok(ImageInfo {
				width,
				height,
				bit_depth: (color.bits_per_pixel() / color.channel_count() as u16) as u8,
				color_space: color_space_name(color),
			})
		})
		.await
	}

	/// The viewing derivative: capped width, orientation applied, JPEG.
	#[tracing::instrument(skip(self, data), name = "Codec::encode_viewing", err)]
	pub async fn encode_viewing(
		&self,
		data: Bytes,
		max_width: u32,
		quality: u8,
		orientation: Option<u32>,
	) -> Result<EncodedImage, CodecError> {
		self.run(move || {
			let img = image::load_from_memory(&data).map_err(CodecError::Decode)?;
			let img = apply_orientation(img, orientation.unwrap_or(1));
			let img = if img.width() > max_width {
				let height = (img.height() as u64 * max_width as u64 / img.width() as u64).max(1) as u32;
				img.resize_exact(max_width, height, FilterType::Lanczos3)
			} else {
				img
			};
			encode_jpeg(&img, quality)
		})
		.await
	}

	/// The model-input derivative: letterboxed onto a square white canvas.
	#[tracing::instrument(skip(self, data), name = "Codec::letterbox", err)]
	pub async fn letterbox(&self, data: Bytes, size: u32, quality: u8) -> Result<EncodedImage, CodecError> {
		self.run(move || {
			let img = image::load_from_memory(&data).map_err(CodecError::Decode)?;
			let fitted = img.resize(size, size, FilterType::Lanczos3);

			let mut canvas = RgbImage::from_pixel(size, size, image::Rgb([0xFF, 0xFF, 0xFF]));
			let x = (size - fitted.width()) / 2;
			let y = (size - fitted.height()) / 2;
			image::imageops::overlay(&mut canvas, &fitted.to_rgb8(), x as i64, y as i64);

			encode_jpeg(&DynamicImage::ImageRgb8(canvas), quality)
		})
		.await
	}

	#[tracing::instrument(skip(self, data), name = "Codec::thumbnail", err)]
	pub async fn thumbnail(&self, data: Bytes, width: u32, quality: u8) -> Result<EncodedImage, CodecError> {
		self.run(move || {
			let img = image::load_from_memory(&data).map_err(CodecError::Decode)?;
			let img = if img.width() > width {
				let height = (img.height() as u64 * width as u64 / img.width() as u64).max(1) as u32;
				img.resize_exact(width, height, FilterType::Lanczos3)
			} else {
				img
			};
			encode_jpeg(&img, quality)
		})
		.await
	}

	/// Re-encodes down the quality ladder until the payload fits.
	#[tracing::instrument(skip(self, data), name = "Codec::reencode_to_fit", err)]
	pub async fn reencode_to_fit(&self, data: Bytes, max_bytes: usize, qualities: &[u8]) -> Result<EncodedImage, CodecError> {
		if data.len() <= max_bytes {
			if let Some(ImageKind::Jpeg) = ImageKind::sniff(&data) {
				// Already a JPEG under the cap; probe for dimensions only.
				let info = self.probe(data.clone()).await?;
				return Ok(EncodedImage {
					data,
					width: info.width,
					height: info.height,
				});
			}
		}

		let qualities = qualities.to_vec();
		self.run(move || {
			let img = image::load_from_memory(&data).map_err(CodecError::Decode)?;

			let mut smallest = usize::MAX;
			for quality in qualities {
				let encoded = encode_jpeg(&img, quality)?;
				if encoded.data.len() <= max_bytes {
					return Ok(encoded);
				}
				smallest = smallest.min(encoded.data.len());
			}

			Err(CodecError::CannotFit {
				limit: max_bytes,
				smallest,
			})
		})
		.await
	}
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<EncodedImage, CodecError> {
	let rgb = img.to_rgb8();
	let (width, height) = rgb.dimensions();

	let mut out = Vec::new();
	let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut out), quality);
	rgb.write_with_encoder(encoder).map_err(CodecError::Encode)?;

	Ok(EncodedImage {
		data: out.into(),
		width,
		height,
	})
}

/// EXIF orientation values 1-8; unknown values pass the image through.
fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
	match orientation {
		2 => img.fliph(),
		3 => img.rotate180(),
		4 => img.flipv(),
		5 => img.rotate90().fliph(),
		6 => img.rotate90(),
		7 => img.rotate270().fliph(),
		8 => img.rotate270(),
		_ => img,
	}
}

fn color_space_name(color: image::ColorType) -> &'static str {
	use image::ColorType;
	match color {
		ColorType::L8 | ColorType::L16 => "gray",
		ColorType::La8 | ColorType::La16 => "gray-alpha",
		ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "rgb",
		ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "rgba",
		_ => "unknown",
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn png_fixture(width: u32, height: u32) -> Bytes {
		let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200])));
		let mut out = Vec::new();
		img.write_to(&mut Cursor::new(&mut out), image::ImageOutputFormat::Png).expect("encode fixture");
		out.into()
	}

	#[test]
	fn sniff_recognizes_the_allow_list() {
		assert_eq!(ImageKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(ImageKind::Jpeg));
		assert_eq!(
			ImageKind::sniff(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00]),
			Some(ImageKind::Png)
		);
		assert_eq!(ImageKind::sniff(&[0x49, 0x49, 0x2A, 0x00]), Some(ImageKind::Tiff));
		assert_eq!(ImageKind::sniff(&[0x4D, 0x4D, 0x00, 0x2A]), Some(ImageKind::Tiff));
		assert_eq!(ImageKind::sniff(b"GIF89a"), None);
		assert_eq!(ImageKind::sniff(b""), None);
	}

	#[tokio::test]
	async fn probe_reports_dimensions() {
		let codec = Codec::new(Duration::from_secs(30));
		let info = codec.probe(png_fixture(320, 240)).await.expect("probe");
		assert_eq!((info.width, info.height), (320, 240));
		assert_eq!(info.color_space, "rgb");
		assert_eq!(info.bit_depth, 8);
	}

	#[tokio::test]
	async fn viewing_caps_width_and_keeps_aspect() {
		let codec = Codec::new(Duration::from_secs(30));
		let encoded = codec
			.encode_viewing(png_fixture(4000, 2000), 2000, 85, None)
			.await
			.expect("encode");
		assert_eq!(encoded.width, 2000);
		assert_eq!(encoded.height, 1000);
		assert_eq!(ImageKind::sniff(&encoded.data), Some(ImageKind::Jpeg));
	}

	#[tokio::test]
	async fn small_images_are_not_upscaled() {
		let codec = Codec::new(Duration::from_secs(30));
		let encoded = codec.thumbnail(png_fixture(100, 60), 200, 80).await.expect("encode");
		assert_eq!((encoded.width, encoded.height), (100, 60));
	}

	#[tokio::test]
	async fn letterbox_is_square() {
		let codec = Codec::new(Duration::from_secs(30));
		let encoded = codec.letterbox(png_fixture(1024, 512), 768, 80).await.expect("encode");
		assert_eq!((encoded.width, encoded.height), (768, 768));
	}

	#[tokio::test]
	async fn reencode_walks_the_quality_ladder() {
		let codec = Codec::new(Duration::from_secs(30));
		let encoded = codec
			.reencode_to_fit(png_fixture(800, 600), 10 * 1024 * 1024, &[85, 80, 70, 60, 50, 40])
			.await
			.expect("encode");
		assert!(encoded.data.len() <= 10 * 1024 * 1024);
		assert_eq!(ImageKind::sniff(&encoded.data), Some(ImageKind::Jpeg));
	}
}
