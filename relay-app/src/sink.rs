//! Sinks used by the command-line frontend.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use relay_transport::{Sample, SampleSink, TransportResult};

/// Writes sample payloads back to back.
///
/// For Annex B output the result is a playable `.h264` elementary stream.
pub struct WriterSink<W> {
    writer: W,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl WriterSink<BufWriter<File>> {
    /// Create (or truncate) `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write + Send> SampleSink for WriterSink<W> {
    fn write_sample(&mut self, sample: Sample) -> TransportResult<()> {
        self.writer.write_all(&sample.data)?;
        Ok(())
    }

    fn flush(&mut self) -> TransportResult<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Discards samples.
#[derive(Debug, Default)]
pub struct NullSink;

impl SampleSink for NullSink {
    fn write_sample(&mut self, _sample: Sample) -> TransportResult<()> {
        Ok(())
    }
}

/// Open the sink selected on the command line.
pub fn open(output: Option<&Path>) -> io::Result<Box<dyn SampleSink>> {
    Ok(match output {
        Some(path) if path == Path::new("-") => Box::new(WriterSink::new(io::stdout())),
        Some(path) => Box::new(WriterSink::create(path)?),
        None => Box::new(NullSink),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn sample(data: &'static [u8]) -> Sample {
        Sample {
            data: Bytes::from_static(data),
            duration: Duration::from_millis(16),
        }
    }

    #[test]
    fn test_writer_sink_concatenates() {
        let mut sink = WriterSink::new(Vec::new());
        sink.write_sample(sample(b"\x00\x00\x00\x01\x65")).unwrap();
        sink.write_sample(sample(b"\x00\x00\x00\x01\x41")).unwrap();
        sink.flush().unwrap();
        assert_eq!(
            sink.into_inner(),
            b"\x00\x00\x00\x01\x65\x00\x00\x00\x01\x41".to_vec()
        );
    }

    #[test]
    fn test_file_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");

        let mut sink = open(Some(&path)).unwrap();
        sink.write_sample(sample(b"abc")).unwrap();
        sink.write_sample(sample(b"def")).unwrap();
        sink.flush().unwrap();
        drop(sink);

        assert_eq!(std::fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn test_unwritable_path() {
        assert!(open(Some(Path::new("/nonexistent/dir/out.ivf"))).is_err());
    }
}
