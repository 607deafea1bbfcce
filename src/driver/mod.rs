//! Module level entry point: transforms every function that may suspend.

use tracing::{debug, info, warn};

use crate::ir::Module;
use crate::transform::{CoroutineTransformation, TransformError, TransformSummary};

pub mod config;

pub use config::Config;

/// Transforms every defined function of `module` that contains a suspension point.
///
/// Functions are visited in declaration order. Runtime support functions imported on the way
/// are not visited. The first failing function aborts the run; functions transformed before it
/// stay transformed.
pub fn transform_module(
    module: &mut Module,
    config: &Config,
) -> Result<Vec<TransformSummary>, TransformError> {
    let functions: Vec<_> = module.functions.iter().map(|(idx, _)| idx).collect();
    let mut transformation =
        CoroutineTransformation::new(module, config.runtime.clone(), config.transform);
    let mut summaries = Vec::new();
    for function in functions {
        let declared = transformation.module().function(function);
        if declared.body.is_none() {
            debug!(name = %declared.name, "skipping import");
            continue;
        }
        if let Some(summary) = transformation.transform_function(function)? {
            summaries.push(summary);
        }
    }
    if summaries.is_empty() {
        warn!("no function in the module contains a suspension point");
    }
    info!(transformed = summaries.len(), "transformed module");
    Ok(summaries)
}
