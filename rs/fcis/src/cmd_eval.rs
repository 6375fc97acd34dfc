//! Eval subcommand: forward a split and aggregate segmentation metrics.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use clap::Args;
use fcis::dataset::{Dataset, LabelPngDataset};
use fcis::preprocess::preprocess_image;
use fcis::Fcis;
use segeval::{SegEvaluator, SegMetrics};

use crate::ModelArgs;

/// Arguments for the eval subcommand
#[derive(Args, Debug)]
pub struct EvalArgs {
    /// Dataset root (should contain '{split}.txt', 'images', 'class' and 'instance').
    #[arg(long)]
    pub dataset_root: PathBuf,

    /// Split to evaluate.
    #[arg(long, default_value = "val")]
    pub split: String,

    /// Path to model weights, in safetensors format.
    #[arg(long)]
    pub model: PathBuf,

    /// Output directory for evaluation results.
    #[arg(long, short, default_value = "eval_output")]
    pub output_dir: PathBuf,

    /// Evaluate at most this many images.
    #[arg(long)]
    pub max_images: Option<usize>,

    #[command(flatten)]
    pub model_args: ModelArgs,
}

/// Run the model over `dataset` and aggregate the metrics.
pub fn evaluate(
    model: &Fcis,
    dataset: &dyn Dataset,
    device: &Device,
    max_images: Option<usize>,
) -> anyhow::Result<SegMetrics> {
    let n_images = max_images.map_or(dataset.len(), |n| n.min(dataset.len()));
    let mut evaluator = SegEvaluator::new(model.config.n_class());
    let start_time = Instant::now();

    for idx in 0..n_images {
        let sample = dataset.get(idx)?;
        let x = preprocess_image(&sample.image, device)?;
        let out = model.forward(&x, &sample.lbl_cls, &sample.lbl_ins)?;
        evaluator.add(
            &out.roi_clss(),
            &out.roi_clss_pred(),
            sample.lbl_cls.view(),
            out.lbl_cls_pred.view(),
            sample.lbl_ins.view(),
            out.lbl_ins_pred.view(),
        );

        // Progress update every 100 images
        if (idx + 1) % 100 == 0 || idx + 1 == n_images {
            let elapsed = start_time.elapsed().as_secs_f32();
            println!(
                "  [{}/{}] {:.1} img/s",
                idx + 1,
                n_images,
                (idx + 1) as f32 / elapsed
            );
        }
    }

    Ok(evaluator.evaluate())
}

/// Run the eval subcommand
pub fn run(args: &EvalArgs, device: &Device) -> anyhow::Result<()> {
    println!("============================================================");
    println!("FCIS Evaluation");
    println!("============================================================");
    println!("Model path: {:?}", args.model);
    println!("Device: {:?}", device);
    println!("Dataset: {:?} ({})", args.dataset_root, args.split);
    println!("Output dir: {:?}", args.output_dir);
    println!("============================================================");

    if !args.model.exists() {
        anyhow::bail!("Model weights not found at {:?}", args.model);
    }
    let dataset = LabelPngDataset::pascal(&args.dataset_root, &args.split)?;
    println!("\n{} images in split '{}'", dataset.len(), args.split);

    let config = args.model_args.config(&dataset)?;
    println!("\nModel config:");
    println!("  Num classes: {}", config.num_classes);
    println!("  Kernel size: {}", config.kernel_size);
    println!("  Score channels: {}", config.score_channels());

    let start = Instant::now();
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[args.model.clone()], DType::F32, device)?
    };
    let model = args.model_args.load(vb, &config)?;
    println!("Model loaded in {:?}", start.elapsed());

    println!("\nRunning evaluation...");
    let metrics = evaluate(&model, &dataset, device, args.max_images)?;

    println!("\n============================================================");
    println!("EVALUATION RESULTS");
    println!("============================================================");
    SegEvaluator::print_summary(&metrics);

    std::fs::create_dir_all(&args.output_dir)?;
    let results_file = args.output_dir.join("eval_results.json");
    let results = serde_json::json!({
        "model": args.model.to_string_lossy(),
        "dataset_root": args.dataset_root.to_string_lossy(),
        "split": args.split,
        "config": config,
        "metrics": metrics,
    });
    let file = std::fs::File::create(&results_file)?;
    serde_json::to_writer_pretty(file, &results)?;
    println!("\nEvaluation metrics saved to: {:?}", results_file);

    Ok(())
}
