use std::{ io::IsTerminal, path::PathBuf, time::Duration };

use clap::{ builder::FalseyValueParser, CommandFactory, Parser };
use tracing::{ info, error, debug };
use anyhow::{ Result, Error };

use crate::{ aggregate::Aggregate, vuln::{ Findings, Nvd, VulnLookup } };

mod logger;
mod scan;
mod version;
mod vuln;
mod aggregate;
mod report;
mod output;

#[derive(Parser)]
#[command(
    version,
    about = "Nmap XML report visualizer with CVE enrichment",
    long_about = "Nmap XML report visualizer with CVE enrichment\n\n\
    Reads an nmap XML report, looks up known vulnerabilities for every detected\n\
    product/version on the NVD (set NVD_API_KEY to enable), prints a terminal\n\
    report and writes one address list per service to the output directory."
)]
struct Cli {
    /// Nmap XML report to read
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,
    /// Increase logging verbosity
    #[arg(short('v'), long, action = clap::ArgAction::Count)]
    verbosity: u8,
    /// Emit logs as JSON lines
    #[arg(long = "json-log", env = "NMAPVIZ_JSON_LOG", value_parser = FalseyValueParser::new())]
    json_log: bool,
    /// Directory receiving one address list per service
    #[arg(
        short('o'),
        long = "output-dir",
        env = "NMAPVIZ_OUTPUT_DIR",
        value_name = "dir",
        default_value = output::DEFAULT_DIR
    )]
    output_dir: PathBuf,
    /// NVD CVE API endpoint
    #[arg(long = "nvd-url", env = "NVD_API_URL", value_name = "url", default_value = vuln::NVD_URL)]
    nvd_url: String,
    /// Timeout in seconds for each vulnerability database request
    #[arg(long, env = "NMAPVIZ_TIMEOUT", value_name = "seconds", default_value_t = 10)]
    timeout: u64,
    /// Disable coloured output
    #[arg(long = "no-color", env = "NO_COLOR", value_parser = FalseyValueParser::new())]
    no_color: bool,
    /// Skip vulnerability lookups
    #[arg(long = "no-vuln", default_value_t = false)]
    no_vuln: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let level = logger::verbosity_to_level_filter(args.verbosity);
    let sub = logger::setup_logger(level, args.json_log);
    tracing::subscriber::set_global_default(sub)?;

    let Some(input) = args.input.clone() else {
        println!("{}", Cli::command().render_usage());
        std::process::exit(1);
    };
    run(args, input).await
}

fn log_fatal(context: &str, err: Error) -> Error {
    error!("error {}: {:?}", context, err);
    err
}

async fn run(args: Cli, input: PathBuf) -> Result<()> {
    let result = scan::parse(&input).map_err(|e| log_fatal("parsing scan report", e.into()))?;
    info!(hosts = result.hosts.len(), "loaded scan report {}", input.display());

    let agg = Aggregate::from_scan(&result);
    let findings = if args.no_vuln {
        debug!("vulnerability lookups disabled");
        Findings::new()
    } else {
        let timeout = Duration::from_secs(args.timeout);
        let nvd = Nvd::new(args.nvd_url, timeout).map_err(|e| log_fatal("creating NVD client", e))?;
        enrich(&VulnLookup::new(Box::new(nvd), timeout), &result).await
    };

    let style = report::Style {
        color: !args.no_color && std::io::stdout().is_terminal(),
        ..Default::default()
    };
    report::Report::new(&result, &agg, &findings, style).print();

    match output::save_address_lists(&args.output_dir, &agg.by_service) {
        Ok(files) =>
            info!(files = files.len(), "address lists saved to {}", args.output_dir.display()),
        Err(e) => error!("{:?}", e),
    }
    Ok(())
}

/// Looks up every distinct product/version pair once, in scan order.
async fn enrich(lookup: &VulnLookup, result: &scan::ScanResult) -> Findings {
    let pairs = aggregate::service_pairs(result);
    let pb = if std::io::stderr().is_terminal() {
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    } else {
        None
    };

    let mut findings = Findings::new();
    for (product, version) in pairs {
        if let Some(pb) = &pb {
            pb.set_message(format!("looking up {} {}", product, version));
        }
        let report = lookup.lookup(&product, &version).await;
        if report.is_empty() {
            debug!("no known vulnerabilities for '{}' '{}'", product, version);
        }
        findings.insert((product, version), report);
    }

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }
    findings
}
