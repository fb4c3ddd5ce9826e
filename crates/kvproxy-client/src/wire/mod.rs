// Frame IO for kvproxy-wire over QUIC streams.
pub(crate) use self::frame_io::{read_message, write_message};

mod frame_io;
