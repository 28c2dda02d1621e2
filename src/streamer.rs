// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Stream collected result files back to the client with stop-and-wait acks.
// Author: Lukas Bower

use std::io::{Read, Write};

use devfarm_wire::{ChannelError, FramedChannel, SizeHeader};
use log::debug;

use crate::job::ResultFile;

/// Send `results` in order. Each file waits for a request ack, announces its
/// size, waits for a second ack and then goes out in `chunk_size` frames.
pub fn stream_results<S: Read + Write>(
    channel: &mut FramedChannel<S>,
    results: &[ResultFile],
    chunk_size: usize,
) -> Result<(), ChannelError> {
    for (index, result) in results.iter().enumerate() {
        channel.receive_ack("result request")?;
        channel.send_header(&SizeHeader {
            file_size: result.data.len() as u64,
        })?;
        channel.receive_ack("size acknowledgement")?;
        channel.send_body(&result.data, chunk_size)?;
        debug!(
            "[devfarm][stream] sent {} ({} bytes, {}/{})",
            result.name,
            result.data.len(),
            index + 1,
            results.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devfarm_wire::{ACK_SEND, ACK_SIZE};
    use std::io::{self, Cursor};

    /// Replays scripted client frames and captures what the server writes.
    struct Duplex {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Duplex {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Duplex {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for payload in payloads {
            bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    fn result(name: &str, data: &[u8]) -> ResultFile {
        ResultFile {
            name: name.into(),
            data: data.to_vec(),
        }
    }

    #[test]
    fn each_result_is_size_then_chunked_body() {
        let client = frames(&[ACK_SEND, ACK_SIZE, ACK_SEND, ACK_SIZE]);
        let duplex = Duplex {
            input: Cursor::new(client),
            output: Vec::new(),
        };
        let mut channel = FramedChannel::new(duplex);
        let results = [result("r0.bin", b"abcdefgh"), result("r1.bin", b"")];
        stream_results(&mut channel, &results, 3).unwrap();

        let written = channel.into_inner().output;
        let mut reader = FramedChannel::new(Cursor::new(written));
        let size: SizeHeader = reader.receive_header().unwrap();
        assert_eq!(size.file_size, 8);
        assert_eq!(reader.receive().unwrap().unwrap(), b"abc");
        assert_eq!(reader.receive().unwrap().unwrap(), b"def");
        assert_eq!(reader.receive().unwrap().unwrap(), b"gh");
        let size: SizeHeader = reader.receive_header().unwrap();
        assert_eq!(size.file_size, 0);
        assert!(reader.receive().unwrap().is_none());
    }

    #[test]
    fn missing_ack_stops_the_stream() {
        let client = frames(&[ACK_SEND]);
        let duplex = Duplex {
            input: Cursor::new(client),
            output: Vec::new(),
        };
        let mut channel = FramedChannel::new(duplex);
        let err = stream_results(&mut channel, &[result("r0.bin", b"x")], 16).unwrap_err();
        assert!(matches!(err, ChannelError::UnexpectedEof(_)));
    }
}
