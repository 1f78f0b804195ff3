//! # Dynamic message codec
//!
//! A `tonic` codec over `prost_reflect::DynamicMessage`, enabling RPC
//! dispatch against methods resolved at runtime instead of generated stubs.
//! Encoding needs no descriptor (a dynamic message knows its own schema);
//! decoding parses into the descriptor of whichever direction this side
//! receives.
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use tonic::Status;
use tonic::codec::{BufferSettings, Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};

/// Codec transporting dynamic messages in both directions.
pub struct DynamicCodec {
    decode_desc: MessageDescriptor,
}

impl DynamicCodec {
    /// Client-side construction: responses decode as the method output.
    pub fn client(method: &MethodDescriptor) -> Self {
        Self {
            decode_desc: method.output(),
        }
    }

    /// Server-side construction: requests decode as the method input.
    pub fn server(method: &MethodDescriptor) -> Self {
        Self {
            decode_desc: method.input(),
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder(self.decode_desc.clone())
    }
}

pub struct DynamicEncoder;

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

pub struct DynamicDecoder(MessageDescriptor);

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let message = DynamicMessage::decode(self.0.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
        Ok(Some(message))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
