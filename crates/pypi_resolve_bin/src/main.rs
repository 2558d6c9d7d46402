use clap::Parser;
use itertools::Itertools;
use miette::{Context, IntoDiagnostic};
use pypi_resolve::index::PackageIndex;
use pypi_resolve::sdist::Pep517SdistBuilder;
use pypi_resolve::{
    normalize_index_url, resolve_requirements, MarkerEnvironment, Requirement, Resolution,
    ResolveOptions, VersionSpecifiers,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

#[derive(Serialize, Debug)]
struct Solution {
    resolved: bool,
    packages: HashMap<String, String>,
    error: Option<String>,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The root requirements to resolve
    #[clap(num_args = 1.., required = true)]
    specs: Vec<Requirement>,

    /// The range of target interpreter versions the resolution has to cover
    #[clap(long, default_value = ">=3.8")]
    requires_python: VersionSpecifiers,

    /// Base URL of the Python Package Index (default <https://pypi.org/simple>). This should point
    /// to a repository compliant with PEP 503 (the simple repository API).
    #[clap(default_value = "https://pypi.org/simple/", long)]
    index_url: Url,

    /// Cache directory, defaults to a platform specific location
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// Trust the index metadata instead of validating it against wheel METADATA
    #[clap(long)]
    no_wheel_metadata: bool,

    /// Resolve the lowest instead of the highest satisfying versions
    #[clap(long)]
    minimum_versions: bool,

    /// Path to the python interpreter used for sdist metadata builds
    #[clap(long, short)]
    python_interpreter: Option<PathBuf>,

    /// Project the resolution onto the environment markers in this JSON file
    /// (the keys of PEP 508, e.g. as printed by
    /// `python -c 'import json, packaging.markers; print(json.dumps(packaging.markers.default_environment()))'`)
    #[clap(long)]
    for_env: Option<PathBuf>,

    /// Extras to activate on the root requirements when projecting with --for-env
    #[clap(long)]
    root_extra: Vec<String>,

    /// Verbose logging
    #[clap(short)]
    verbose: bool,

    #[clap(long)]
    json: bool,
}

async fn actual_main() -> miette::Result<()> {
    let args = Args::parse();

    // Setup tracing subscriber
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| get_default_env_filter(args.verbose)),
        )
        .init();

    // Determine cache directory
    let cache_dir = match &args.cache_dir {
        Some(cache_dir) => cache_dir.clone(),
        None => dirs::cache_dir()
            .ok_or_else(|| miette::miette!("failed to determine cache directory"))?
            .join("pypi-resolve"),
    };
    tracing::info!("cache directory: {}", cache_dir.display());

    let client = reqwest::Client::new();
    let index = PackageIndex::new(
        client.clone(),
        &normalize_index_url(args.index_url.clone()),
        &cache_dir,
    )
    .into_diagnostic()
    .wrap_err_with(|| {
        format!(
            "failed to construct package index client for {}",
            args.index_url
        )
    })?;

    let mut builder = Pep517SdistBuilder::new(client, &cache_dir)
        .into_diagnostic()
        .wrap_err("failed to construct sdist builder")?;
    if let Some(python) = &args.python_interpreter {
        builder = builder.with_python(python.clone());
    }

    let options = ResolveOptions {
        download_wheels: !args.no_wheel_metadata,
        maximum_versions: !args.minimum_versions,
    };

    let resolution = match resolve_requirements(
        args.specs.clone(),
        &args.requires_python,
        &index,
        &builder,
        &options,
    )
    .await
    {
        Ok(resolution) => resolution,
        Err(err) => {
            return if args.json {
                let solution = Solution {
                    resolved: false,
                    packages: HashMap::default(),
                    error: Some(format!("{err}")),
                };
                println!("{}", serde_json::to_string_pretty(&solution).unwrap());
                Ok(())
            } else {
                Err(miette::Report::new(err)
                    .wrap_err("could not solve for the requested requirements"))
            }
        }
    };

    // Optionally filter down to a concrete environment
    let resolution = match &args.for_env {
        Some(env_file) => {
            let env_json = fs_err::read_to_string(env_file).into_diagnostic()?;
            let env: MarkerEnvironment = serde_json::from_str(&env_json)
                .into_diagnostic()
                .wrap_err_with(|| format!("invalid marker environment in {}", env_file.display()))?;
            resolution.for_environment(&env, &args.root_extra)
        }
        None => resolution,
    };

    print_resolution(&args, &resolution)?;

    if args.json {
        let solution = Solution {
            resolved: true,
            packages: resolution
                .packages
                .iter()
                .map(|((name, version), _)| (name.to_string(), version.to_string()))
                .collect(),
            error: None,
        };
        println!("{}", serde_json::to_string_pretty(&solution).unwrap());
    }

    Ok(())
}

fn print_resolution(args: &Args, resolution: &Resolution) -> miette::Result<()> {
    println!("{}:", console::style("Resolved environment").bold());
    for spec in args.specs.iter() {
        println!("- {}", spec);
    }

    println!();
    let mut tabbed_stdout = tabwriter::TabWriter::new(std::io::stdout());
    writeln!(
        tabbed_stdout,
        "{}\t{}",
        console::style("Name").bold(),
        console::style("Version").bold()
    )
    .into_diagnostic()?;
    for ((name, version), data) in resolution
        .packages
        .iter()
        .sorted_by(|((a, _), _), ((b, _), _)| a.cmp(b))
    {
        write!(tabbed_stdout, "{name}").into_diagnostic()?;
        if !data.extras.is_empty() {
            write!(tabbed_stdout, "[{}]", data.extras.iter().join(",")).into_diagnostic()?;
        }
        writeln!(tabbed_stdout, "\t{version}").into_diagnostic()?;
    }
    tabbed_stdout.flush().into_diagnostic()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = actual_main().await {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}

/// Constructs a default [`EnvFilter`] that is used when the user did not specify a custom RUST_LOG.
fn get_default_env_filter(verbose: bool) -> EnvFilter {
    let directive = if verbose {
        "pypi_resolve=debug"
    } else {
        "pypi_resolve=info"
    };
    EnvFilter::new("pypi_resolve_bin=info")
        .add_directive(Directive::from_str(directive).unwrap())
}
