pub mod assets;
pub mod backend;
pub mod budget;
pub mod coverage;
pub mod imaging;
pub mod tts;
pub mod workflow;
