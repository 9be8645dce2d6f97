pub use log_writer::LogWriter;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::Layer;
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

mod format;
mod log_writer;

pub fn registry_logs(
    writer: &mut LogWriter,
    level: Level,
    dir: Option<PathBuf>,
    enable_file_logging: bool,
) -> anyhow::Result<()> {
    let mut layers = Vec::new();
    let dir = dir.unwrap_or_else(|| PathBuf::from("/var/log/hearthvault"));
    // event_layer: index / network event records (target: "event")
    {
        let event_layer = tracing_subscriber::fmt::layer().with_ansi(false);
        let event_layer = if enable_file_logging {
            let event_file = writer.create_file_writer(dir.join("event.log"))?;
            event_layer
                .with_writer(event_file)
                .with_filter(filter::filter_fn(|metadata| metadata.target() == "event"))
                .boxed()
        } else {
            event_layer
                .with_filter(filter::filter_fn(|metadata| metadata.target() == "event"))
                .boxed()
        };
        layers.push(event_layer);
    }
    // generic_layer: everything from this crate, custom compact format
    {
        let generic_layer = tracing_subscriber::fmt::layer()
            .event_format(format::Formatter::new(true))
            .with_filter(filter::LevelFilter::from(level))
            .with_filter(filter::filter_fn(move |metadata| {
                &level <= metadata.level()
                    && metadata
                        .module_path()
                        .map(|it| it.starts_with("hearthvault::") || it == "hearthvault")
                        .unwrap_or(false)
            }));
        layers.push(generic_layer.boxed());
    }
    tracing_subscriber::registry()
        .with(layers)
        .with(tracing_error::ErrorLayer::default())
        .init();
    Ok(())
}
