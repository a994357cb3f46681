use std::sync::Arc;

use aiy_quant::marigold;
use aiy_quant::quantizers::{presets, PipelineQuantizationConfig, Registries};
use clap::{Parser, ValueEnum};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    Bnb4bitNf4,
    Bnb8bit,
    QuantoInt8,
    MarigoldLowMemory,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML plan file, takes precedence over `--preset`.
    #[arg(long)]
    plan: Option<String>,

    #[arg(long, value_enum, default_value = "marigold-low-memory")]
    preset: Preset,

    #[arg(long, default_value = "MarigoldDepthPipeline")]
    pipeline: String,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn main() -> anyhow::Result<()> {
    let Args { plan, preset, pipeline, tracing } = Args::parse();

    let _guard = if tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();
        None
    };

    let registries: Arc<Registries> = Registries::builtin();
    let plan = match plan {
        Some(path) => PipelineQuantizationConfig::from_file(path, registries)?,
        None => {
            let spec = match preset {
                Preset::Bnb4bitNf4 => presets::bnb_4bit_nf4(),
                Preset::Bnb8bit => presets::bnb_8bit(),
                Preset::QuantoInt8 => presets::quanto_int8(),
                Preset::MarigoldLowMemory => presets::marigold_low_memory(),
            };
            PipelineQuantizationConfig::new(spec, registries)?
        }
    };
    println!("{plan}");

    let export = marigold::module().get(&pipeline)?;
    let descriptor = export
        .as_pipeline()
        .ok_or_else(|| anyhow::anyhow!("{pipeline} is not a pipeline"))?;
    let task = descriptor.task;
    println!(
        "{} -> {} {:?}, {} channel(s)",
        descriptor.name,
        task.output_name(),
        task.output_fields(),
        task.prediction_channels()
    );
    let resolved = plan.resolve_components(descriptor)?;
    for component in descriptor.components() {
        match resolved.get(component.name) {
            Some(config) => {
                println!("[{}] {}", component.name, config.class_name());
                print!("{}", toml::to_string(config)?);
            }
            None => println!("[{}] not quantized", component.name),
        }
    }
    Ok(())
}
