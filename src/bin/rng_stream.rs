use overlapped_pipeline::{
    HostTransfer, PipelineConfig, PipelineRunner, WriterSink, XorShiftCompute,
};
use overlapped_pipeline::pipeline::{DEFAULT_NUM_ITER, DEFAULT_NUM_RN};
use std::env;
use std::io::{self, BufWriter, Write};

/// Streams raw little-endian u64 random numbers to stdout.
///
/// Usage: rng_stream [num_rn] [num_iter]
#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    )
    .format(|buf, record| {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(
            buf,
            "[{} {}] {}",
            ts,
            record.level(),
            record.args()
        )
    })
    .init();

    let args: Vec<String> = env::args().collect();
    if args.len() > 3 {
        eprintln!("Usage: {} [num_rn] [num_iter]", args[0]);
        eprintln!("Example: {} 1048576 100 > out.bin", args[0]);
        std::process::exit(1);
    }

    let num_rn = match args.get(1).map(|arg| arg.parse::<usize>()) {
        None => DEFAULT_NUM_RN,
        Some(Ok(num_rn)) => num_rn,
        Some(Err(_)) => {
            eprintln!("Error: Invalid num_rn '{}' - must be a number", args[1]);
            std::process::exit(1);
        }
    };
    let num_iter = match args.get(2).map(|arg| arg.parse::<u64>()) {
        None => DEFAULT_NUM_ITER,
        Some(Ok(num_iter)) => num_iter,
        Some(Err(_)) => {
            eprintln!("Error: Invalid num_iter '{}' - must be a number", args[2]);
            std::process::exit(1);
        }
    };

    let config =
        PipelineConfig::new(num_rn, num_iter).with_item_width(XorShiftCompute::ITEM_WIDTH);
    let sink = WriterSink::new(BufWriter::with_capacity(1 << 20, io::stdout()));

    let compute = XorShiftCompute::default();
    let runner = match PipelineRunner::new(config, compute, HostTransfer::new(), sink) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match runner.run_async().await {
        Ok(report) => {
            log::info!(
                "wrote {} bytes in {:?} \
                 (compute {:?}, transfer {:?}, sink {:?}, producer waited {:?})",
                report.bytes_written,
                report.elapsed,
                report.metrics.compute_time,
                report.metrics.transfer_time,
                report.metrics.sink_time,
                report.metrics.produce_wait_time,
            );
        }
        Err(fault) => {
            log::error!("{}", fault);
            std::process::exit(1);
        }
    }
}
