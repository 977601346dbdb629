pub mod input;
pub mod output;
pub mod speech;
pub mod transport;
pub mod voice;
