//! Output renderer interface consumed by the notebook model.

use jupyter_wire::MimeBundle;

/// A rendered output owned by the notebook model.
pub trait DisplayHandle: Send {
    fn id(&self) -> &str;

    /// Release whatever the renderer allocated for this output.
    fn dispose(&mut self);
}

/// Turns mime bundles into displayed outputs.
///
/// Called with the notebook locked, so implementations must not call back
/// into the [`Notebook`](crate::Notebook).
pub trait RendererRegistry: Send + Sync {
    fn can_render(&self, bundle: &MimeBundle) -> bool;

    fn render(&self, bundle: &MimeBundle) -> Box<dyn DisplayHandle>;
}
