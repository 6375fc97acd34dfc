//! Train subcommand: serial Adam training with periodic logging, validation
//! and snapshots.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Args;
use fcis::dataset::{Dataset, LabelPngDataset};
use fcis::model::copy_pretrained;
use fcis::preprocess::preprocess_image;
use fcis::ForwardReport;
use log::info;
use segeval::SegMetrics;
use serde::Serialize;

use crate::cmd_eval::evaluate;
use crate::ModelArgs;

const SNAPSHOT_PREFIX: &str = "FCIS_model_iter_";

/// Arguments for the train subcommand
#[derive(Args, Debug, Serialize)]
pub struct TrainArgs {
    /// Dataset root (should contain 'train.txt', 'val.txt', 'images', 'class' and 'instance').
    #[arg(long)]
    pub dataset_root: PathBuf,

    /// Output directory for logs and snapshots.
    #[arg(long, short, default_value = "logs")]
    pub output_dir: PathBuf,

    /// Pretrained VGG16 weights, in safetensors format.
    #[arg(long)]
    pub pretrained: Option<PathBuf>,

    /// Resume from a snapshot written by a previous run. Weights and the
    /// iteration count are restored; Adam moments restart from zero.
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Adam learning rate.
    #[arg(long, default_value_t = 0.002)]
    pub lr: f64,

    #[arg(long, default_value_t = 10000)]
    pub max_iter: usize,

    /// Iterations between log entries.
    #[arg(long, default_value_t = 10)]
    pub interval_log: usize,

    /// Iterations between validation runs and snapshots.
    #[arg(long, default_value_t = 100)]
    pub interval_eval: usize,

    /// Validate on at most this many images.
    #[arg(long)]
    pub max_val_images: Option<usize>,

    #[command(flatten)]
    pub model_args: ModelArgs,
}

/// One line of `log.json`
#[derive(Debug, Serialize)]
struct LogEntry {
    iteration: usize,
    epoch: usize,
    elapsed_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    main: Option<ForwardReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<SegMetrics>,
}

/// Iteration encoded in a snapshot file name
fn snapshot_iteration(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(SNAPSHOT_PREFIX)?
        .parse()
        .ok()
}

fn write_log(path: &Path, log: &[LogEntry]) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, log)?;
    Ok(())
}

/// Run the train subcommand
pub fn run(args: &TrainArgs, device: &Device) -> anyhow::Result<()> {
    println!("============================================================");
    println!("FCIS Training");
    println!("============================================================");
    println!("Device: {:?}", device);
    println!("Dataset: {:?}", args.dataset_root);
    println!("Output dir: {:?}", args.output_dir);
    println!("Learning rate: {}", args.lr);
    println!("Max iterations: {}", args.max_iter);
    println!("============================================================");

    if args.output_dir.exists() && args.resume.is_none() {
        anyhow::bail!(
            "Output directory {:?} already exists, remove it or pass --resume",
            args.output_dir
        );
    }
    if args.interval_log == 0 || args.interval_eval == 0 {
        anyhow::bail!("--interval-log and --interval-eval must be positive");
    }
    std::fs::create_dir_all(&args.output_dir)?;

    let dataset_train = LabelPngDataset::pascal(&args.dataset_root, "train")?;
    let dataset_val = LabelPngDataset::pascal(&args.dataset_root, "val")?;
    if dataset_train.is_empty() {
        anyhow::bail!("Training split of {:?} is empty", args.dataset_root);
    }
    println!(
        "\n{} training images, {} validation images",
        dataset_train.len(),
        dataset_val.len()
    );

    // Model
    let config = args.model_args.config(&dataset_train)?;
    let mut varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = args.model_args.load(vb, &config)?;

    let mut start_iter = 0;
    if let Some(resume) = &args.resume {
        println!("Resuming from: {:?} (optimizer moments restart)", resume);
        varmap.load(resume)?;
        start_iter = snapshot_iteration(resume).unwrap_or(0);
    } else if let Some(pretrained) = &args.pretrained {
        println!("Copying pretrained weights from: {:?}", pretrained);
        let copied = copy_pretrained(&mut varmap, pretrained, device)?;
        println!("  Copied {} tensors", copied);
    }

    let params = serde_json::json!({ "args": args, "config": config });
    let file = std::fs::File::create(args.output_dir.join("params.json"))?;
    serde_json::to_writer_pretty(file, &params)?;

    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: args.lr,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    // Training loop
    let log_path = args.output_dir.join("log.json");
    let mut log = Vec::new();
    let mut reports = Vec::with_capacity(args.interval_log);
    let start_time = Instant::now();

    println!("\nTraining from iteration {}...", start_iter);
    for iteration in start_iter..args.max_iter {
        let sample = dataset_train.get(iteration % dataset_train.len())?;
        let x = preprocess_image(&sample.image, device)?;
        let out = model.forward(&x, &sample.lbl_cls, &sample.lbl_ins)?;
        optimizer.backward_step(&out.loss)?;
        reports.push(out.report()?);

        let done = iteration + 1;
        let epoch = done / dataset_train.len();

        if done % args.interval_log == 0 {
            let main = ForwardReport::mean(&reports);
            reports.clear();
            println!(
                "  iter {:>6}  loss {:.4} (rpn {:.4} cls {:.4} seg {:.4})  acc_cls {:.3}  iu_cls {:.3}  iu_ins {:.3}",
                done,
                main.loss,
                main.loss_rpn,
                main.loss_cls,
                main.loss_seg,
                main.accuracy_cls,
                main.iu_lbl_cls,
                main.iu_lbl_ins
            );
            log.push(LogEntry {
                iteration: done,
                epoch,
                elapsed_time: start_time.elapsed().as_secs_f64(),
                main: Some(main),
                validation: None,
            });
            write_log(&log_path, &log)?;
        }

        if done % args.interval_eval == 0 {
            println!("\nValidating at iteration {}...", done);
            let metrics = evaluate(&model, &dataset_val, device, args.max_val_images)?;
            segeval::SegEvaluator::print_summary(&metrics);
            log.push(LogEntry {
                iteration: done,
                epoch,
                elapsed_time: start_time.elapsed().as_secs_f64(),
                main: None,
                validation: Some(metrics),
            });
            write_log(&log_path, &log)?;

            let snapshot = args
                .output_dir
                .join(format!("{SNAPSHOT_PREFIX}{done}.safetensors"));
            varmap.save(&snapshot)?;
            info!("snapshot saved to {}", snapshot.display());
            println!("Snapshot saved to: {:?}\n", snapshot);
        }
    }

    println!("\n============================================================");
    println!(
        "Training complete in {:.1}s",
        start_time.elapsed().as_secs_f32()
    );
    println!("============================================================");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_iteration() {
        let path = Path::new("logs/FCIS_model_iter_1200.safetensors");
        assert_eq!(snapshot_iteration(path), Some(1200));
        assert_eq!(snapshot_iteration(Path::new("vgg16.safetensors")), None);
    }

    #[test]
    fn test_resume_help_mentions_optimizer_restart() {
        use clap::CommandFactory;

        let cli = crate::Cli::command();
        let train = cli.find_subcommand("train").unwrap();
        let resume = train
            .get_arguments()
            .find(|arg| arg.get_id() == "resume")
            .unwrap();
        let help = resume.get_help().unwrap().to_string();
        assert!(help.contains("Adam moments restart"));
    }
}
