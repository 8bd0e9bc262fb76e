//! Chrome trace output for sampling runs (feature `profiling`).
//!
//! With the feature on, the sampler and condition embedder open `info_span!`s
//! around each denoiser call, predictor update and rescale; [`init`] routes them
//! to a Chrome trace file viewable in [Perfetto](https://ui.perfetto.dev).
//! Without the feature, [`init`] returns `None` and the spans compile away.

use std::path::Path;

/// Default trace file, relative to the working directory.
pub const TRACE_FILE: &str = "diffsinger_trace.json";

/// Flushes the trace file on drop. Hold it until the end of `main()`.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Install the Chrome tracing layer writing to [`TRACE_FILE`].
///
/// ```rust,ignore
/// let _guard = diffsinger_acoustic::profiling::init();
/// model.sample(&condition, &options)?;
/// ```
pub fn init() -> Option<ProfilingGuard> {
    init_with_file(TRACE_FILE)
}

/// Install the Chrome tracing layer writing to `path`.
pub fn init_with_file<P: AsRef<Path>>(path: P) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(path.as_ref())
            .include_args(true)
            .build();

        tracing_subscriber::registry().with(chrome_layer).init();

        tracing::info!("Profiling enabled, writing {}", path.as_ref().display());
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        let _ = path;
        None
    }
}
