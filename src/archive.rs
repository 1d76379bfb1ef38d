use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Write `data` as the single entry `entry_name` of a new zip file at `output`
pub fn write_single_entry(output: &Path, entry_name: &str, data: &[u8]) -> io::Result<()> {
    let file = File::create(output)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(entry_name, options).map_err(io::Error::other)?;
    zip.write_all(data)?;
    zip.finish().map_err(io::Error::other)?;
    Ok(())
}
