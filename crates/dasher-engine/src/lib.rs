//! Refinement engine: service adapters, the refinement controller and the
//! threaded session driver that feeds it.

pub mod adapters;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod images;

pub use adapters::{
    AnalysisEndpoint, DryrunAnalyzer, DryrunGenerator, GenerationConfig, HttpAnalyzer,
    HttpGenerator, ImageAnalyzer, ImageBytes, ImageGenerator,
};
pub use cancel::CancelToken;
pub use config::EngineConfig;
pub use controller::{
    Completion, OptionChoice, OptionImage, Outcome, RefinementController, Request, RequestKind,
    Stage, State, Ticket,
};
pub use driver::{PickStrategy, Session, Settled};
pub use error::{AnalysisError, GenerationError};
pub use images::{ImageHandle, ImageStore};
