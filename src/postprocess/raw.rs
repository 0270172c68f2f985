use super::{PostProcessor, PostProcessorError};

pub const NAME: &str = "raw";

/// Pass-through
#[derive(Debug, Default, Clone, Copy)]
pub struct Raw;

impl PostProcessor for Raw {
    fn identity(&self) -> String {
        NAME.to_string()
    }

    fn initialize(&mut self, _identifier: &str, _pv_name: &str) -> Result<(), PostProcessorError> {
        Ok(())
    }
}
