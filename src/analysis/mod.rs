pub mod batch;
pub mod error;
pub mod micrograph;
pub mod plot;
pub mod protocols;
pub mod recording;
pub mod spikes;
pub mod stats;

pub use batch::{analyze_folder, analyze_one, Outcome};
pub use error::AnalysisError;
pub use plot::{DataType, Figure, RenderOptions};
pub use protocols::{AnalysisContext, Routine};
pub use recording::{Recording, Sweep};
pub use spikes::{SpikeDetector, SpikeTrains};
