pub mod audio;
pub mod text;
