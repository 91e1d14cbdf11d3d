#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::info;

use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::path;
use std::sync::Arc;

use looptree::agent::LoopTreeAgent;
use looptree::backend::{Backend, BackendConfig, ClangBackend, Interpreter};
use looptree::common::DimSize;
use looptree::graph::{matmul, vector_add, Graph};
use looptree::metrics::Metric;
use looptree::search::rank_actions;
use looptree::utils::ToWriteFmt;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serialized agent state; `-` reads from stdin
    #[arg(long, short, default_value = "-")]
    state: String,

    /// Write the resulting state back to the state file (or stdout for `-`)
    #[arg(long, short, default_value_t = false)]
    write: bool,

    /// Backend used to time loop trees
    #[arg(long, value_enum, default_value_t = BackendId::Interp)]
    backend: BackendId,

    /// Timed samples per measurement
    #[arg(long)]
    samples: Option<u32>,

    /// Kernel executions per compiled-binary run
    #[arg(long)]
    steps: Option<u32>,

    /// Seed for input tensor contents
    #[arg(long)]
    seed: Option<u64>,

    /// C compiler; defaults to $CLANG, then `clang`
    #[arg(long)]
    compiler: Option<String>,

    /// Number of parallel jobs for ranking
    #[arg(long, short)]
    jobs: Option<usize>,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendId {
    Interp,
    Clang,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    /// Start a new agent at the first line of a canned graph
    #[command(subcommand)]
    New(GraphKind),

    /// Print the loop tree with the cursor marked
    Dump,

    /// Apply actions in order, then print the loop tree
    Apply {
        #[arg(required = true)]
        actions: Vec<String>,
    },

    /// List the actions legal at the cursor
    Actions,

    /// Evaluate a metric (FLOPs, FLOPS, seconds)
    Eval { metric: String },

    /// Score every legal action by a metric, best first
    Rank { metric: String },

    /// Print the C program the clang backend would build
    Emit,
}

#[derive(clap::Subcommand)]
enum GraphKind {
    /// Elementwise sum of two vectors
    VectorAdd { size: DimSize },
    /// Product of an m-by-k and a k-by-n matrix
    Matmul {
        m: DimSize,
        n: DimSize,
        k: DimSize,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let backend = make_backend(&args);

    let mut agent = match &args.subcmd {
        Subcommand::New(kind) => {
            let graph: Graph = match kind {
                GraphKind::VectorAdd { size } => vector_add(*size),
                GraphKind::Matmul { m, n, k } => matmul(*m, *n, *k),
            };
            info!("Starting from graph:\n{graph}");
            let agent = LoopTreeAgent::with_backend(graph, backend)?;
            if !args.write {
                println!("{}", agent.serialize()?);
                return Ok(());
            }
            agent
        }
        _ => LoopTreeAgent::deserialize(&read_state(&args.state)?, backend)?,
    };

    match &args.subcmd {
        Subcommand::New(_) => {}
        Subcommand::Dump => print!("{}", agent.dump()),
        Subcommand::Apply { actions } => {
            for name in actions {
                agent.apply_action(name)?;
            }
            print!("{}", agent.dump());
        }
        Subcommand::Actions => {
            for action in agent.available_actions()? {
                println!("{action}");
            }
        }
        Subcommand::Eval { metric } => println!("{}", agent.eval(metric)?),
        Subcommand::Rank { metric } => {
            let metric = metric
                .parse::<Metric>()
                .map_err(|_| anyhow::anyhow!("Unknown metric {metric:?}\n{}", Metric::help()))?;
            let start_time = std::time::Instant::now();
            let ranked = rank_actions(&agent, metric, args.jobs.and_then(NonZeroUsize::new))?;
            info!("rank_actions took {:?}", start_time.elapsed());
            for (action, score) in ranked {
                println!("{action:>16} {score}");
            }
        }
        Subcommand::Emit => {
            ClangBackend::new(backend_config(&args))
                .emit(agent.tree(), &mut ToWriteFmt(io::stdout()))
                .context("failed to write C source")?;
        }
    }

    if args.write {
        write_state(&args.state, &agent.serialize()?)?;
    }
    Ok(())
}

fn backend_config(args: &Args) -> BackendConfig {
    let defaults = BackendConfig::default();
    BackendConfig {
        samples: args.samples.unwrap_or(defaults.samples),
        steps: args.steps.unwrap_or(defaults.steps),
        seed: args.seed.unwrap_or(defaults.seed),
        compiler: args.compiler.clone(),
    }
}

fn make_backend(args: &Args) -> Arc<dyn Backend> {
    let config = backend_config(args);
    match args.backend {
        BackendId::Interp => Arc::new(Interpreter::new(config)),
        BackendId::Clang => Arc::new(ClangBackend::new(config)),
    }
}

fn read_state(state: &str) -> Result<String> {
    if state == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read state from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(path::Path::new(state))
        .with_context(|| format!("failed to read state from {state}"))
}

fn write_state(state: &str, text: &str) -> Result<()> {
    if state == "-" {
        println!("{text}");
        return Ok(());
    }
    std::fs::write(path::Path::new(state), text)
        .with_context(|| format!("failed to write state to {state}"))
}
