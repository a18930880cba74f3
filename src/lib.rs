pub mod error;
pub mod models;
pub mod trainers;

// Re-export common types
pub use error::{FinetuneError, Result};
pub use trainers::{load_config, train_from_config, Config, StepCoordinator, TrainingSummary};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped `log` output; `RUST_LOG` overrides the default `info` level.
    pub fn init_logger() {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info);
        if let Ok(spec) = std::env::var("RUST_LOG") {
            builder.parse_filters(&spec);
        }
        let _ = builder.try_init();
    }
}
