// # Syncset workbench
//
// Command-line front end for the workload harness: pick one of the
// sixteen container variants, run the disjoint-range insert/remove
// workload against it and verify the key-sum identity.

use clap::{Parser, ValueEnum};
use syncset::bench::{self, WorkloadConfig, WorkloadReport};
use syncset::core::{ConcurrentQueue, ConcurrentSet, Key, MAX_LEVEL};
use syncset::hash::{
    ChainHash, ConcurrentCuckooHash, CuckooHash, OpenAddrHash, RefinableHash, StripedHash,
};
use syncset::list::{CoarseList, FineList, FomitchevList, HarrisList, LazyList};
use syncset::queue::{LlScQueue, MsQueue};
use syncset::skiplist::{LazySkiplist, LockFreeSkiplist, PlainSkiplist};
use syncset::Result;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Structure {
    CoarseList,
    FineList,
    LazyList,
    HarrisList,
    FomitchevList,
    Skiplist,
    LazySkiplist,
    LockfreeSkiplist,
    ChainHash,
    OpenAddrHash,
    StripedHash,
    RefinableHash,
    CuckooHash,
    ConcurrentCuckooHash,
    MsQueue,
    LlscQueue,
}

impl Structure {
    fn is_queue(self) -> bool {
        matches!(self, Structure::MsQueue | Structure::LlscQueue)
    }
}

/// Simple algorithm test bench for the concurrent containers
#[derive(Parser, Debug)]
#[command(name = "syncset-bench", about, disable_version_flag = true)]
struct Cli {
    /// Container variant to exercise
    #[arg(value_enum)]
    structure: Structure,

    /// Number of worker threads (clamped to 200)
    #[arg(short = 't', long = "threads", default_value_t = bench::DEFAULT_THREADS)]
    threads: usize,

    /// Items inserted and deleted per thread (clamped to 30000)
    #[arg(short = 'n', long = "items", default_value_t = bench::DEFAULT_ITEMS)]
    items: usize,

    /// Initial bucket count (chained / striped / refinable hash)
    #[arg(short = 'b', long = "buckets", default_value_t = 4)]
    buckets: usize,

    /// Initial table size exponent (open-address / cuckoo hash)
    #[arg(short = 's', long = "size-exp", default_value_t = 4)]
    size_exp: usize,

    /// Max level (skiplists, clamped to 16)
    #[arg(short = 'l', long = "max-level", default_value_t = 4)]
    max_level: usize,

    /// Per-bucket hard capacity (concurrent cuckoo hash)
    #[arg(long = "probe-size", default_value_t = 4)]
    probe_size: usize,

    /// Per-bucket soft capacity (concurrent cuckoo hash)
    #[arg(long = "threshold", default_value_t = 2)]
    threshold: usize,

    /// Verbose output
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Debug output (same as -vv)
    #[arg(short = 'V')]
    debug: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug || cli.verbose >= 2 {
        tracing::Level::TRACE
    } else if cli.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_max_level(level)
        .init();
}

fn build_set(cli: &Cli) -> Result<Box<dyn ConcurrentSet>> {
    let max_level = cli.max_level.min(MAX_LEVEL);
    Ok(match cli.structure {
        Structure::CoarseList => Box::new(CoarseList::new()),
        Structure::FineList => Box::new(FineList::new()),
        Structure::LazyList => Box::new(LazyList::new()),
        Structure::HarrisList => Box::new(HarrisList::new()),
        Structure::FomitchevList => Box::new(FomitchevList::new()),
        Structure::Skiplist => Box::new(PlainSkiplist::new(max_level, Key::MIN, Key::MAX)?),
        Structure::LazySkiplist => Box::new(LazySkiplist::new(max_level, Key::MIN, Key::MAX)?),
        Structure::LockfreeSkiplist => {
            Box::new(LockFreeSkiplist::new(max_level, Key::MIN, Key::MAX)?)
        }
        Structure::ChainHash => Box::new(ChainHash::new(cli.buckets)?),
        Structure::OpenAddrHash => Box::new(OpenAddrHash::new(cli.size_exp)?),
        Structure::StripedHash => Box::new(StripedHash::new(cli.buckets)?),
        Structure::RefinableHash => Box::new(RefinableHash::new(cli.buckets)?),
        Structure::CuckooHash => Box::new(CuckooHash::new(cli.size_exp)?),
        Structure::ConcurrentCuckooHash => Box::new(ConcurrentCuckooHash::new(
            cli.size_exp,
            cli.probe_size,
            cli.threshold,
        )?),
        Structure::MsQueue | Structure::LlscQueue => unreachable!("queues handled separately"),
    })
}

fn build_queue(cli: &Cli) -> Box<dyn ConcurrentQueue> {
    match cli.structure {
        Structure::MsQueue => Box::new(MsQueue::new()),
        Structure::LlscQueue => Box::new(LlScQueue::new()),
        _ => unreachable!("sets handled separately"),
    }
}

fn print_report(cli: &Cli, config: &WorkloadConfig, report: &WorkloadReport) {
    if report.passed {
        println!("RESULT: test OK");
    } else {
        println!(
            "RESULT: test FAILED (total {} != expected {})",
            report.total, report.expected
        );
    }
    println!("condition =>");
    println!("\t{:?} exercised by {} threads", cli.structure, config.threads);
    println!(
        "\t{} items inserted and deleted / thread, total {} items",
        config.items,
        config.items * config.threads
    );
    println!("performance =>");
    println!("\tinterval = {:.6} [sec]", report.elapsed.as_secs_f64());
    println!(
        "\tthread info: ave. = {:.6}[sec], min = {:.6}[sec], max = {:.6}[sec]",
        report.avg_interval().as_secs_f64(),
        report.min_interval().as_secs_f64(),
        report.max_interval().as_secs_f64()
    );
}

fn run(cli: &Cli) -> Result<WorkloadReport> {
    let config = WorkloadConfig::new(cli.threads, cli.items)?;
    info!(structure = ?cli.structure, threads = config.threads, items = config.items, "starting workload");

    let report = if cli.structure.is_queue() {
        let queue = build_queue(cli);
        bench::run_queue_workload(queue.as_ref(), &config)?
    } else {
        let set = build_set(cli)?;
        bench::run_set_workload(set.as_ref(), &config)?
    };
    print_report(cli, &config, &report);
    Ok(report)
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    println!("<<simple algorithm test bench>>");

    match run(&cli) {
        Ok(report) if report.passed => std::process::exit(0),
        Ok(_) => std::process::exit(1),
        Err(err) => {
            eprintln!("ERROR: {err}");
            std::process::exit(2);
        }
    }
}
