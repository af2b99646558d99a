use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;
use zkexport::quantize::Quantizer;
use zkexport::tensor::read_array_file;
use zkexport::{
    CommandQuantizer, Exporter, InputSpec, NativeQuantizer, OnnxExporter, ScaleConfig, Sequential,
    DEFAULT_DATA_PATH, DEFAULT_GRAPH_PATH,
};
use zkexport_onnx::quantizer::{DEFAULT_SCALE_BASE, DEFAULT_SCALE_EXPONENT};

#[derive(Parser)]
#[command(name = "zkexport")]
#[command(about = "Export a model to ONNX plus a quantized input/output record")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the model once and write the graph and data files.
    Export(ExportArgs),
    /// Quantize a data file against a graph: <data> <graph> <output>.
    Forward {
        data: PathBuf,
        graph: PathBuf,
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SCALE_EXPONENT)]
        scale_exponent: u32,
    },
}

#[derive(Args)]
struct ExportArgs {
    /// Sequential model description (JSON).
    #[arg(short, long)]
    model: PathBuf,
    /// Input shape without the batch axis, e.g. `9,2`.
    #[arg(long, value_delimiter = ',')]
    shape: Option<Vec<usize>>,
    /// Literal input array (JSON), without the batch axis.
    #[arg(long)]
    array: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_GRAPH_PATH)]
    onnx: PathBuf,
    #[arg(long, default_value = DEFAULT_DATA_PATH)]
    data: PathBuf,
    /// Seed for the random input; drawn from the OS when omitted.
    #[arg(long)]
    seed: Option<u64>,
    /// External quantizer, called as `PROG [ARGS..] <data> <graph> <data>`.
    #[arg(long)]
    quantizer_cmd: Option<String>,
    #[arg(long = "quantizer-arg", allow_hyphen_values = true)]
    quantizer_args: Vec<String>,
    #[arg(long, default_value_t = DEFAULT_SCALE_EXPONENT)]
    scale_exponent: u32,
}

fn run_export(args: ExportArgs) -> anyhow::Result<()> {
    let model = Sequential::from_json_file(&args.model)?;

    let mut spec = InputSpec::default();
    if let Some(shape) = args.shape {
        spec = spec.with_shape(shape);
    }
    if let Some(path) = &args.array {
        spec = spec.with_array(read_array_file(path)?);
    }

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let quantizer: Box<dyn Quantizer> = match args.quantizer_cmd {
        Some(program) => Box::new(CommandQuantizer::new(program).args(args.quantizer_args)),
        None => Box::new(NativeQuantizer::new(ScaleConfig::new(
            DEFAULT_SCALE_BASE,
            args.scale_exponent,
        )?)),
    };

    let record = Exporter::new(OnnxExporter, quantizer)
        .export(&model, &spec, &args.onnx, &args.data, &mut rng)
        .context("export failed")?;

    tracing::info!(
        inputs = record.input_data[0].len(),
        outputs = record.output_data.len(),
        "done"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Export(args) => run_export(args),
        Commands::Forward {
            data,
            graph,
            output,
            scale_exponent,
        } => {
            let scale = ScaleConfig::new(DEFAULT_SCALE_BASE, scale_exponent)?;
            NativeQuantizer::new(scale)
                .forward(&data, &graph, &output)
                .context("quantization failed")
        }
    }
}
