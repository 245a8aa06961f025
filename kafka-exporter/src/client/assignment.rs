//! Decoding of the consumer protocol's member assignment.
//!
//! Layout (all integers big-endian):
//! ```text
//! version:     i16
//! topics:      i32 count, then per topic
//!   name:        i16 length + UTF-8 bytes
//!   partitions:  i32 count, then i32 each
//! user_data:   i32 length + bytes (ignored)
//! ```

use bytes::Buf;
use thiserror::Error;

use crate::types::TopicPartitionId;

/// Protocol type of groups whose assignments follow the layout above.
pub const CONSUMER_PROTOCOL: &str = "consumer";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssignmentError {
    #[error("assignment truncated while reading {0}")]
    Truncated(&'static str),

    #[error("negative length for {0}")]
    NegativeLength(&'static str),

    #[error("topic name is not valid UTF-8")]
    InvalidTopicName,
}

fn read_len(buf: &mut &[u8], field: &'static str, width: usize) -> Result<usize, AssignmentError> {
    if buf.remaining() < width {
        return Err(AssignmentError::Truncated(field));
    }
    let len = if width == 2 {
        i32::from(buf.get_i16())
    } else {
        buf.get_i32()
    };
    usize::try_from(len).map_err(|_| AssignmentError::NegativeLength(field))
}

pub fn decode_member_assignment(mut buf: &[u8]) -> Result<Vec<TopicPartitionId>, AssignmentError> {
    // An empty assignment is sent by members that have not been given work yet
    if buf.is_empty() {
        return Ok(Vec::new());
    }

    if buf.remaining() < 2 {
        return Err(AssignmentError::Truncated("version"));
    }
    let _version = buf.get_i16();

    let topic_count = read_len(&mut buf, "topic count", 4)?;
    let mut assigned = Vec::new();
    for _ in 0..topic_count {
        let name_len = read_len(&mut buf, "topic name length", 2)?;
        if buf.remaining() < name_len {
            return Err(AssignmentError::Truncated("topic name"));
        }
        let topic = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| AssignmentError::InvalidTopicName)?
            .to_string();
        buf.advance(name_len);

        let partition_count = read_len(&mut buf, "partition count", 4)?;
        if buf.remaining() < partition_count * 4 {
            return Err(AssignmentError::Truncated("partitions"));
        }
        for _ in 0..partition_count {
            assigned.push(TopicPartitionId::new(topic.clone(), buf.get_i32()));
        }
    }

    Ok(assigned)
}
