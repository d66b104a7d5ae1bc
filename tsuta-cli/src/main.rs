//! Tsuta CLI - コマンドラインインターフェース
//!
//! 実行中プロセスまたはコアダンプのスタックトレースを表示します。

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tsuta_core::{Frame, ThreadStack, TraceOptions, Tracer};
use tsuta_elf::{CacheConfig, ImageCache};
use tsuta_target::{CoreProcess, LiveProcess, LogProcess, Target};

/// Tsuta - print stack traces of processes and cores
#[derive(Parser)]
#[command(name = "tsuta")]
#[command(version)]
#[command(about = "Print a stack trace of each PID or core given", long_about = None)]
struct Cli {
    /// PIDs or core files to trace (a non-core ELF argument overrides
    /// the default executable for the targets after it)
    targets: Vec<String>,

    /// Executable to use by default
    #[arg(short = 'e', long = "executable")]
    executable: Option<PathBuf>,

    /// Replace `from` with `to` in paths when finding shared libraries
    #[arg(short = 'F', long = "replace-path", value_name = "FROM:TO")]
    replace_path: Vec<String>,

    /// Extra location to find debug files for binaries and libraries
    #[arg(short = 'g', long = "debug-dir")]
    debug_dir: Vec<PathBuf>,

    /// Repeat, with `delay` seconds between each iteration
    #[arg(short = 'b', long = "delay")]
    delay: Option<f64>,

    /// Maximum number of stack frames to print for a thread
    #[arg(short = 'M', long = "max-frames", default_value_t = 1024)]
    max_frames: usize,

    /// Attempt to show the value of arguments to functions
    #[arg(short = 'a', long = "args")]
    do_args: bool,

    /// Don't include source info
    #[arg(short = 's', long = "no-src")]
    no_src: bool,

    /// Don't load external debugging information
    #[arg(short = 'n', long = "no-ext-debug")]
    no_ext_debug: bool,

    /// Print stack trace given a log file including instruction pointers
    #[arg(short = 'L', long = "from-log")]
    from_log: Vec<PathBuf>,

    /// More debugging output. Can be repeated
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // tracing subscriberを初期化
    // -v の回数で既定レベルを上げる（RUST_LOGがあればそちらを優先）
    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    if cli.targets.is_empty() && cli.from_log.is_empty() {
        anyhow::bail!("no targets; give a PID or a core file (see --help)");
    }

    // SIGINTはフラグを立てるだけ。2回目は既定動作で即終了する。
    let interrupted = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register_conditional_default(
        signal_hook::consts::SIGINT,
        Arc::clone(&interrupted),
    )?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupted))?;

    let cache = ImageCache::new(CacheConfig {
        debug_dirs: {
            let mut dirs = CacheConfig::default().debug_dirs;
            dirs.extend(cli.debug_dir.iter().cloned());
            dirs
        },
        path_rewrites: parse_rewrites(&cli.replace_path)?,
        load_external_debug: !cli.no_ext_debug,
    });

    let options = TraceOptions {
        max_frames: cli.max_frames,
        do_args: cli.do_args,
        no_src: cli.no_src,
    };

    let mut exec = match &cli.executable {
        Some(path) => Some(cache.image_for_path(path)?),
        None => None,
    };

    let mut failures = 0;

    if !cli.from_log.is_empty() {
        let exec = exec
            .clone()
            .ok_or_else(|| anyhow::anyhow!("--from-log requires --executable"))?;
        let process = LogProcess::new(exec, &cli.from_log)?;
        run_target(&process, &cache, &options, cli.delay, &interrupted)?;
    }

    for target in &cli.targets {
        let result = trace_one(target, &mut exec, &cache, &options, cli.delay, &interrupted);
        if let Err(e) = result {
            eprintln!("trace of {} failed: {}", target, e);
            failures += 1;
        }
        if interrupted.load(Ordering::Relaxed) {
            break;
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// `from:to`形式の書き換え規則を解析する
fn parse_rewrites(rules: &[String]) -> Result<Vec<(String, String)>> {
    let mut rewrites = Vec::new();
    for rule in rules {
        let Some((from, to)) = rule.split_once(':') else {
            anyhow::bail!("bad --replace-path '{}', expected from:to", rule);
        };
        rewrites.push((from.to_string(), to.to_string()));
    }
    Ok(rewrites)
}

/// 1つのターゲット引数を処理する
///
/// 数字ならPID、コアファイルならコア、それ以外のELFイメージは
/// 以降のターゲットの既定の実行ファイルになります。
fn trace_one(
    target: &str,
    exec: &mut Option<Arc<tsuta_elf::Image>>,
    cache: &ImageCache,
    options: &TraceOptions,
    delay: Option<f64>,
    interrupted: &AtomicBool,
) -> Result<()> {
    if let Ok(pid) = target.parse::<i32>() {
        let exec_path = exec.as_ref().map(|i| i.path().to_path_buf());
        let process = LiveProcess::new(pid, exec_path.as_deref(), cache)?;
        return run_target(&process, cache, options, delay, interrupted);
    }

    let image = cache.image_for_path(target)?;
    if image.is_core() {
        let process = CoreProcess::new(exec.clone(), image, cache)?;
        run_target(&process, cache, options, delay, interrupted)
    } else {
        // コアでないELFは以降の既定の実行ファイル
        *exec = Some(image);
        Ok(())
    }
}

/// 収集と出力の繰り返しループ
///
/// delayが指定されなければ1回だけ。割り込みフラグは反復の境界で
/// だけ確認し、進行中の収集は完了させます。
fn run_target(
    target: &dyn Target,
    cache: &ImageCache,
    options: &TraceOptions,
    delay: Option<f64>,
    interrupted: &AtomicBool,
) -> Result<()> {
    let tracer = Tracer::new(cache, options.clone());

    while !interrupted.load(Ordering::Relaxed) {
        let stacks = tracer.collect(target)?;
        print_stacks(target, &stacks);

        match delay {
            Some(seconds) if seconds > 0.0 => {
                std::thread::sleep(std::time::Duration::from_secs_f64(seconds));
            }
            _ => break,
        }
    }
    Ok(())
}

fn print_stacks(target: &dyn Target, stacks: &[ThreadStack]) {
    let exec = target
        .loaded_objects()
        .first()
        .map(|o| o.image.path().display().to_string())
        .unwrap_or_else(|| "??".to_string());
    println!("process: {} (pid {})", exec, target.pid());

    for stack in stacks {
        println!("thread: {}", stack.lwp);
        for (i, frame) in stack.frames.iter().enumerate() {
            print_frame(i, frame);
        }
        if let Some(error) = &stack.error {
            println!("    <stack truncated: {}>", error);
        }
        println!();
    }
}

fn print_frame(index: usize, frame: &Frame) {
    let mut line = format!("#{:<3} {:#018x} ", index, frame.pc);

    match &frame.symbol {
        Some(symbol) => {
            line.push_str(symbol);
            if frame.offset != 0 {
                line.push_str(&format!("+{:#x}", frame.offset));
            }
        }
        None => line.push_str("??"),
    }

    if !frame.args.is_empty() {
        let rendered: Vec<String> = frame
            .args
            .iter()
            .map(|arg| {
                let name = arg.name.as_deref().unwrap_or("?");
                match arg.value {
                    Some(value) => format!("{}={:#x}", name, value),
                    None => format!("{}=<optimized out>", name),
                }
            })
            .collect();
        line.push_str(&format!(" ({})", rendered.join(", ")));
    }

    if let Some((file, lineno)) = &frame.source {
        line.push_str(&format!(" ({}:{})", file, lineno));
    }
    if frame.inlined {
        line.push_str(" (inlined)");
    }

    println!("{}", line);
}
