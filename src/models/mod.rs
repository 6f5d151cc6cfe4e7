pub mod batch_types;
pub mod media_types;
