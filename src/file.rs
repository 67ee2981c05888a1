//! Line-oriented text files, gzip-compressed when the path ends in `.gz`.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::{Error, Result};

fn is_gzip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

pub struct ReadableFile {
    path: PathBuf,
    reader: Box<dyn BufRead>,
}

impl ReadableFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let reader: Box<dyn BufRead> = if is_gzip(&path) {
            Box::new(BufReader::new(MultiGzDecoder::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        Ok(Self { path, reader })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next line without its terminator, or `None` at end of file.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| Error::io(&self.path, e))?;
        if n == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    pub fn lines(mut self) -> impl Iterator<Item = Result<String>> {
        std::iter::from_fn(move || self.read_line().transpose())
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

pub struct WritableFile {
    path: PathBuf,
    sink: Sink,
}

impl WritableFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = BufWriter::new(File::create(&path).map_err(|e| Error::io(&path, e))?);
        let sink = if is_gzip(&path) {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };
        Ok(Self { path, sink })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let writer: &mut dyn Write = match &mut self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w,
        };
        writeln!(writer, "{line}").map_err(|e| Error::io(&self.path, e))
    }

    /// Flush buffered data and write the gzip trailer.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let mut inner = match self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish().map_err(|e| Error::io(&path, e))?,
        };
        inner.flush().map_err(|e| Error::io(&path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(name: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);

        let mut out = WritableFile::create(&path).unwrap();
        out.write_line("the cat").unwrap();
        out.write_line("").unwrap();
        out.write_line("sat").unwrap();
        out.finish().unwrap();

        let lines: Vec<String> = ReadableFile::open(&path)
            .unwrap()
            .lines()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lines, ["the cat", "", "sat"]);
    }

    #[test]
    fn plain_text_round_trip() {
        round_trip("corpus.txt");
    }

    #[test]
    fn gzip_round_trip() {
        round_trip("corpus.txt.gz");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = ReadableFile::open("/nonexistent/corpus.txt").err().unwrap();
        assert!(matches!(err, Error::Io { .. }));
    }
}
