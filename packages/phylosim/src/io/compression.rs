use crate::io::fs::extension;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzCompressionLevel;
use log::debug;
use std::env;
use std::io::{Read, Write};
use std::path::Path;

#[derive(strum_macros::Display, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
  Gzip,
  None,
}

pub fn guess_compression_from_filepath(filepath: impl AsRef<Path>) -> CompressionType {
  let filepath = filepath.as_ref();

  match extension(filepath).map(|ext| ext.to_lowercase()) {
    None => CompressionType::None,
    Some(ext) => {
      let compression_type = match ext.as_str() {
        "gz" => CompressionType::Gzip,
        _ => CompressionType::None,
      };

      debug!(
        "When processing '{filepath:#?}': detected file extension '{ext}'. \
        It will be using algorithm: '{compression_type}'"
      );

      compression_type
    }
  }
}

fn get_comp_level() -> u32 {
  env::var("GZ_COMPRESSION")
    .ok()
    .and_then(|val| val.parse::<u32>().ok())
    .unwrap_or(2)
}

pub struct Decompressor<'r> {
  decompressor: Box<dyn Read + 'r>,
}

impl<'r> Decompressor<'r> {
  pub fn new<R: 'r + Read>(reader: R, compression_type: CompressionType) -> Self {
    let decompressor: Box<dyn Read> = match compression_type {
      CompressionType::Gzip => Box::new(MultiGzDecoder::new(reader)),
      CompressionType::None => Box::new(reader),
    };

    Self { decompressor }
  }

  pub fn from_path<R: 'r + Read>(reader: R, filepath: impl AsRef<Path>) -> Self {
    let compression_type = guess_compression_from_filepath(filepath);
    Self::new(reader, compression_type)
  }
}

impl<'r> Read for Decompressor<'r> {
  fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
    self.decompressor.read(buf)
  }
}

pub struct Compressor<'w> {
  compressor: Box<dyn Write + Send + 'w>,
}

impl<'w> Compressor<'w> {
  pub fn new<W: 'w + Write + Send>(writer: W, compression_type: CompressionType) -> Self {
    let compressor: Box<dyn Write + Send + 'w> = match compression_type {
      CompressionType::Gzip => Box::new(GzEncoder::new(writer, GzCompressionLevel::new(get_comp_level()))),
      CompressionType::None => Box::new(writer),
    };

    Self { compressor }
  }
}

impl<'w> Write for Compressor<'w> {
  fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
    self.compressor.write(buf)
  }

  fn flush(&mut self) -> std::io::Result<()> {
    self.compressor.flush()
  }
}

impl<'w> Drop for Compressor<'w> {
  fn drop(&mut self) {
    self.flush().ok();
  }
}
