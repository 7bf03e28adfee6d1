pub mod decoder_layer;
mod transformer_decoder;

pub use decoder_layer::{DecoderContext, DecoderLayer};
pub use transformer_decoder::TransformerDecoder;
