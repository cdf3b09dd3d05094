use tracing::info;

use super::{Engine, EngineKind};
use crate::build::BuildContext;
use crate::error::Result;
use crate::image::Image;
use crate::tools::Tool;

/// Returns the input image unchanged. Useful for conversion-only runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEngine;

impl Engine for NoopEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Noop
    }

    fn required_tools(&self, _ctx: &BuildContext<'_>) -> Vec<(Tool, Option<String>)> {
        Vec::new()
    }

    fn configure(&self, ctx: &BuildContext<'_>) -> Result<Image> {
        info!("noop engine: passing through {} image {}", ctx.input.kind(), ctx.input);
        Ok(ctx.input.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{context, qemu_input};
    use crate::process::testing::RecordingRunner;

    #[test]
    fn returns_input_without_side_effects() {
        let runner = RecordingRunner::new();
        let input = qemu_input("/srv/base.qcow2");
        let ctx = context(&runner, EngineKind::Noop, input.clone(), false);
        assert_eq!(NoopEngine.configure(&ctx).unwrap(), input);
        assert!(runner.calls().is_empty());
        assert!(NoopEngine.required_tools(&ctx).is_empty());
    }
}
