use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::error;

use nc2regions::cli::{Cli, Commands, ConfigFormat, OutputFormat, RunOverrides, resolve_config};
use nc2regions::info::{
    get_input_info, print_input_info_csv, print_input_info_human, print_input_info_json, print_input_info_yaml,
};
use nc2regions::input::JobConfig;
use nc2regions::log::{config_echo, show_batch_report, show_farewell_with_timing, show_greeting, show_plan};
use nc2regions::pipeline::{PipelineContext, RegionSelection};
use nc2regions::regions::RegionFields;
use nc2regions::{RunOptions, collate_outputs, process_job};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = dispatch(cli) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn dispatch(cli: Cli) -> Result<()> {
    let chatty = !cli.quiet && cli.output_format == OutputFormat::Human;

    match cli.command {
        Commands::Run {
            grid_dir,
            shapefile,
            output_dir,
            combined,
            bbox,
            regenerate,
            regions,
            overrides,
            area_code_field,
            id_field,
            extension,
            no_collate,
            dry_run,
        } => {
            let start = Instant::now();
            let source = cli
                .config
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "command line".to_string());

            let config = resolve_config(
                cli.config.as_deref(),
                &RunOverrides {
                    grid_dir,
                    shapefile,
                    output_dir,
                    combined,
                    bbox,
                    regenerate,
                    overrides,
                    area_code_field,
                    id_field,
                    extension,
                },
            )?;

            if chatty {
                show_greeting(&source);
                config_echo(&config);
            }

            let options = RunOptions {
                selection: if regions.is_empty() {
                    RegionSelection::All
                } else {
                    RegionSelection::Ids(regions)
                },
                dry_run,
                collate: !no_collate,
                show_progress: chatty,
            };

            let summary = process_job(&config, &options)?;

            if chatty {
                if dry_run {
                    show_plan(&summary.planned, summary.skipped_existing, &summary.columns);
                }
                if let Some(report) = &summary.report {
                    show_batch_report(report);
                }
                if let Some(combined) = &summary.combined {
                    println!("\nCombined output: {} ({} rows)", combined.path.display(), combined.rows);
                }
                show_farewell_with_timing(start.elapsed());
            }
            Ok(())
        }

        Commands::Collate { output_dir, combined } => {
            let file_config = cli.config.as_deref().map(JobConfig::from_file).transpose()?;
            let output_dir = output_dir
                .or_else(|| file_config.as_ref().map(|c| c.output_dir.clone()))
                .context("No output directory given: pass it as an argument or use --config")?;
            let combined = combined
                .or_else(|| file_config.as_ref().map(|c| c.combined_output_path()))
                .unwrap_or_else(|| {
                    let mut name = output_dir.clone().into_os_string();
                    name.push(".csv");
                    PathBuf::from(name)
                });

            let rows = collate_outputs(&output_dir, &combined, None)?;
            if chatty {
                println!("Combined output: {} ({} rows)", combined.display(), rows);
            }
            Ok(())
        }

        Commands::Info {
            grid,
            shapefile,
            format,
        } => {
            let file_config = cli.config.as_deref().map(JobConfig::from_file).transpose()?;
            let grid = grid.or_else(|| file_config.as_ref().map(|c| c.grid_dir.clone()));
            let shapefile = shapefile.or_else(|| file_config.as_ref().map(|c| c.shapefile.clone()));
            if grid.is_none() && shapefile.is_none() {
                anyhow::bail!("Nothing to describe: pass --grid and/or --shapefile, or use --config");
            }

            let (options, fields, overrides) = match &file_config {
                Some(c) => (c.grid_options(), c.fields.clone(), c.column_overrides.clone()),
                None => (
                    Default::default(),
                    RegionFields::default(),
                    nc2regions::aggregate::default_column_overrides(),
                ),
            };

            let info = get_input_info(grid.as_deref(), shapefile.as_deref(), &options, &fields, &overrides)?;
            match format.unwrap_or(cli.output_format) {
                OutputFormat::Human => print_input_info_human(&info),
                OutputFormat::Json => print_input_info_json(&info)?,
                OutputFormat::Yaml => print_input_info_yaml(&info)?,
                OutputFormat::Csv => print_input_info_csv(&info)?,
            }
            Ok(())
        }

        Commands::Validate { config_file, detailed } => {
            let path = config_file
                .or(cli.config)
                .context("No configuration file given")?;
            let config = JobConfig::from_file(&path)?;
            config.validate()?;
            config.check_paths()?;
            if detailed {
                let context = PipelineContext::prepare(&config)?;
                if chatty {
                    println!(
                        "Inputs: {} variables, {} regions",
                        context.store.len(),
                        context.catalog.len()
                    );
                    println!("Columns: {}", context.order.columns().join(", "));
                }
            }
            if chatty {
                println!("Configuration {} is valid", path.display());
            }
            Ok(())
        }

        Commands::Template { output, format } => {
            let template = JobConfig::template();
            let text = match format {
                ConfigFormat::Json => template.to_json()?,
                ConfigFormat::Yaml => template.to_yaml()?,
            };
            write_to(output, text.as_bytes())
        }

        Commands::Completions { shell, output } => {
            let mut buffer = Vec::new();
            clap_complete::generate(shell, &mut Cli::command(), "nc2regions", &mut buffer);
            write_to(output, &buffer)
        }
    }
}

fn write_to(output: Option<PathBuf>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => {
            let mut file = File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;
            file.write_all(bytes)?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(bytes)?;
            stdout.write_all(b"\n")?;
        }
    }
    Ok(())
}
