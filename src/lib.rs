pub mod analysis;

pub use analysis::batch::{analyze_folder, analyze_one, Outcome};
pub use analysis::error::AnalysisError;
pub use analysis::plot::RenderOptions;
pub use analysis::recording::Recording;
