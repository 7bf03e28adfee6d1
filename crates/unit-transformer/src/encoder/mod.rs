pub mod encoder_layer;
mod transformer_encoder;

pub use encoder_layer::EncoderLayer;
pub use transformer_encoder::TransformerEncoder;
