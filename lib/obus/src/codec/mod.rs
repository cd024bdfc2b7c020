pub mod decoder;
pub mod field;
pub mod packet;
pub mod record_codec;

pub use decoder::PacketDecoder;
pub use packet::{encode_packet, AckStatus, ConnStatus, EventRecord, ObjectAdd, ObjectRemove, Packet, PacketType, HEADER_LEN, MAGIC, PROTOCOL_VERSION};
