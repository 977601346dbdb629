//! Response resolution and movement/speech coordination for the animatronic worm.
//!
//! Utterances flow through [`resolver::ResponseResolver`] into a
//! [`coordinator::Coordinator`], which drives a [`io::transport::MotorSink`] and a
//! [`io::speech::SpeechService`] on a background task.

pub mod catalog;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod io;
pub mod resolver;
pub mod runtime;
pub mod types;
