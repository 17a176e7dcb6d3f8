//! Rendering of job failures into storable diagnostics.
//!
//! Storage backends are not required to persist live error values, so a
//! failed run is recorded as text: the error message, its full `Caused by:`
//! chain, and the backtrace captured when the error was created (present
//! when `RUST_BACKTRACE`/`RUST_LIB_BACKTRACE` enable capture).
//!
//! The concrete error type is not recorded; errors that need a tag carry it
//! in their message or a `.context(..)` layer.

/// Render an error into the text stored for a failed execution.
///
/// Deterministic for a given error value: rendering the same error twice
/// yields identical text.
pub fn render_error(error: &anyhow::Error) -> String {
    format!("{error:?}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[derive(Debug, thiserror::Error)]
    #[error("metrics backend returned 503")]
    struct UpstreamUnavailable;

    #[test]
    fn rendering_includes_cause_chain() {
        let err = Err::<(), _>(UpstreamUnavailable)
            .context("evaluating alert query")
            .unwrap_err();

        let rendered = render_error(&err);
        assert!(rendered.starts_with("evaluating alert query"));
        assert!(rendered.contains("Caused by:"));
        assert!(rendered.contains("metrics backend returned 503"));
    }

    #[test]
    fn rendering_is_deterministic() {
        let err = anyhow::anyhow!("something went wrong.");
        assert_eq!(render_error(&err), render_error(&err));
        assert_ne!(render_error(&err), "");
    }
}
