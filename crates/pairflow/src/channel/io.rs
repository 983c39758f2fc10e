//! Async record reader/writer over channel endpoints.
//!
//! Endpoints are registered with the tokio reactor through
//! `tokio::net::unix::pipe`, which also verifies the descriptor really is a
//! pipe. Must be constructed from within a tokio runtime.

use futures::{SinkExt, StreamExt};
use tokio::net::unix::pipe;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{Record, RecordCodec};
use super::{ChannelError, ReadEnd, WriteEnd};

/// Writes whole records into a [`WriteEnd`].
pub struct RecordWriter {
    inner: FramedWrite<pipe::Sender, RecordCodec>,
}

impl RecordWriter {
    pub fn new(write_end: WriteEnd) -> Result<Self, ChannelError> {
        let sender = pipe::Sender::from_owned_fd(write_end.into_owned_fd())
            .map_err(ChannelError::IoFailure)?;
        Ok(Self {
            inner: FramedWrite::new(sender, RecordCodec::new()),
        })
    }

    /// Write one record, waiting until it is fully handed to the pipe.
    pub async fn write_record(&mut self, value: Record) -> Result<(), ChannelError> {
        self.inner
            .send(value)
            .await
            .map_err(ChannelError::from_write)
    }

    /// Flush and close the write end. The reader sees end-of-stream once no
    /// other copy of the write end is open.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        let result = self.inner.close().await.map_err(ChannelError::from_write);
        drop(self.inner);
        tracing::trace!("Write end closed");
        result
    }
}

/// Reads whole records from a [`ReadEnd`].
pub struct RecordReader {
    inner: FramedRead<pipe::Receiver, RecordCodec>,
}

impl RecordReader {
    pub fn new(read_end: ReadEnd) -> Result<Self, ChannelError> {
        let receiver = pipe::Receiver::from_owned_fd(read_end.into_owned_fd())
            .map_err(ChannelError::IoFailure)?;
        Ok(Self {
            inner: FramedRead::new(receiver, RecordCodec::new()),
        })
    }

    /// Next record, or `None` at end-of-stream.
    pub async fn read_record(&mut self) -> Result<Option<Record>, ChannelError> {
        match self.inner.next().await {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(e)) => Err(ChannelError::IoFailure(e)),
            None => Ok(None),
        }
    }

    pub fn close(self) {
        drop(self.inner);
        tracing::trace!("Read end closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::Channel;

    #[tokio::test]
    async fn records_arrive_in_write_order() {
        let (read_end, write_end) = Channel::create().unwrap().into_split();
        let mut writer = RecordWriter::new(write_end).unwrap();
        let mut reader = RecordReader::new(read_end).unwrap();

        for value in [3, 1, 2] {
            writer.write_record(value).await.unwrap();
        }
        writer.close().await.unwrap();

        let mut seen = Vec::new();
        while let Some(value) = reader.read_record().await.unwrap() {
            seen.push(value);
        }
        assert_eq!(seen, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn end_of_stream_waits_for_every_writer_copy() {
        let (read_end, write_end) = Channel::create().unwrap().into_split();
        let leaked = write_end.try_clone().unwrap();
        let mut reader = RecordReader::new(read_end).unwrap();

        let writer = RecordWriter::new(write_end).unwrap();
        writer.close().await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(200), reader.read_record()).await;
        assert!(pending.is_err(), "reader must block while a writer copy is open");

        leaked.close();
        let eof = tokio::time::timeout(Duration::from_secs(5), reader.read_record())
            .await
            .expect("reader should see end-of-stream once the leak is closed")
            .unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn write_without_reader_is_broken_channel() {
        let (read_end, write_end) = Channel::create().unwrap().into_split();
        read_end.close();

        let mut writer = RecordWriter::new(write_end).unwrap();
        let err = writer.write_record(1).await.unwrap_err();
        assert!(matches!(err, ChannelError::BrokenChannel(_)));
    }

    #[tokio::test]
    async fn truncated_record_is_io_failure() {
        use std::io::Write;

        let (read_end, write_end) = Channel::create().unwrap().into_split();
        let mut reader = RecordReader::new(read_end).unwrap();

        let mut raw = std::fs::File::from(write_end.into_owned_fd());
        raw.write_all(&[0xAB, 0xCD]).unwrap();
        drop(raw);

        let err = reader.read_record().await.unwrap_err();
        assert!(matches!(err, ChannelError::IoFailure(_)));
    }
}
