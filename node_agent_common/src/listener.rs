use crate::wire::Heartbeat;
use crate::OutputBundle;

/// Receiver of pushed process output.
///
/// An error from any method tells the pushing side that this consumer is
/// gone; the host then destroys the process it was watching.
pub trait OutputListener: Send + Sync {
    fn handle_output_bundle(&self, bundle: &OutputBundle) -> anyhow::Result<()>;

    /// One batch, oldest first.
    fn handle_output_bundles(&self, bundles: &[OutputBundle]) -> anyhow::Result<()> {
        for bundle in bundles {
            self.handle_output_bundle(bundle)?;
        }
        Ok(())
    }

    fn handle_heartbeat(&self, _heartbeat: &Heartbeat) -> anyhow::Result<()> {
        Ok(())
    }
}
