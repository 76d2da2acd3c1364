//! # CLI Integration Tests
//!
//! Tests for the command-line interface: argument parsing, value parsers and
//! configuration resolution.

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};
    use std::path::PathBuf;

    use crate::cli::{Cli, Commands, ConfigFormat, OutputFormat, RunOverrides, resolve_config};
    use crate::input::{JobConfig, ResumePolicy};

    /// Test basic CLI argument parsing
    #[test]
    fn test_cli_help() {
        let result = Cli::try_parse_from(["nc2regions", "-h"]);
        assert!(result.is_err()); // -h causes early exit with "error"

        let error = result.unwrap_err();
        assert!(error.to_string().contains("Extract per-region daily time series"));

        let error = Cli::try_parse_from(["nc2regions", "--help"]).unwrap_err();
        assert!(error.to_string().contains("nc2regions reduces gridded NetCDF climate data"));
    }

    /// Test version argument
    #[test]
    fn test_cli_version() {
        let result = Cli::try_parse_from(["nc2regions", "--version"]);
        assert!(result.is_err()); // --version causes early exit
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    /// Test global flags
    #[test]
    fn test_cli_global_flags() {
        let cli = Cli::parse_from([
            "nc2regions",
            "--verbose",
            "--output-format",
            "json",
            "--config",
            "/path/to/job.yaml",
            "template",
        ]);

        assert!(cli.verbose);
        assert!(!cli.quiet);
        assert_eq!(cli.output_format, OutputFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/job.yaml")));
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        let result = Cli::try_parse_from(["nc2regions", "-v", "-q", "template"]);
        assert!(result.is_err());
    }

    /// Test run command argument parsing
    #[test]
    fn test_run_command_full() {
        let cli = Cli::parse_from([
            "nc2regions",
            "run",
            "grid",
            "counties.shp",
            "out/counties",
            "--combined",
            "out/all.parquet",
            "--bbox",
            "24:50:-125:-66",
            "--regenerate",
            "-r",
            "12",
            "--region",
            "40",
            "--override",
            "tas:air_temperature:K",
            "--no-collate",
            "--dry-run",
        ]);

        if let Commands::Run {
            grid_dir,
            shapefile,
            output_dir,
            combined,
            bbox,
            regenerate,
            regions,
            overrides,
            no_collate,
            dry_run,
            ..
        } = cli.command
        {
            assert_eq!(grid_dir, Some(PathBuf::from("grid")));
            assert_eq!(shapefile, Some(PathBuf::from("counties.shp")));
            assert_eq!(output_dir, Some(PathBuf::from("out/counties")));
            assert_eq!(combined, Some(PathBuf::from("out/all.parquet")));
            assert_eq!(bbox.map(|b| b.lat_range()), Some((24.0, 50.0)));
            assert!(regenerate);
            assert_eq!(regions, vec![12, 40]);
            assert_eq!(overrides.len(), 1);
            assert_eq!(overrides[0].name, "air_temperature");
            assert!(no_collate);
            assert!(dry_run);
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_run_rejects_bad_values() {
        assert!(Cli::try_parse_from(["nc2regions", "run", "g", "s.shp", "o", "--bbox", "1:2:3"]).is_err());
        assert!(Cli::try_parse_from(["nc2regions", "run", "g", "s.shp", "o", "--region", "abc"]).is_err());
        assert!(Cli::try_parse_from(["nc2regions", "run", "g", "s.shp", "o", "--override", "tas"]).is_err());
    }

    #[test]
    fn test_collate_command() {
        let cli = Cli::parse_from(["nc2regions", "collate", "out/counties", "out/counties.csv"]);
        if let Commands::Collate { output_dir, combined } = cli.command {
            assert_eq!(output_dir, Some(PathBuf::from("out/counties")));
            assert_eq!(combined, Some(PathBuf::from("out/counties.csv")));
        } else {
            panic!("Expected Collate command");
        }
    }

    #[test]
    fn test_info_command() {
        let cli = Cli::parse_from([
            "nc2regions",
            "info",
            "--grid",
            "data/grid",
            "--shapefile",
            "data/counties.shp",
            "--format",
            "yaml",
        ]);
        if let Commands::Info {
            grid,
            shapefile,
            format,
        } = cli.command
        {
            assert_eq!(grid, Some(PathBuf::from("data/grid")));
            assert_eq!(shapefile, Some(PathBuf::from("data/counties.shp")));
            assert_eq!(format, Some(OutputFormat::Yaml));
        } else {
            panic!("Expected Info command");
        }
    }

    #[test]
    fn test_validate_command() {
        let cli = Cli::parse_from(["nc2regions", "validate", "job.json", "--detailed"]);
        if let Commands::Validate { config_file, detailed } = cli.command {
            assert_eq!(config_file, Some(PathBuf::from("job.json")));
            assert!(detailed);
        } else {
            panic!("Expected Validate command");
        }
    }

    #[test]
    fn test_template_command() {
        let cli = Cli::parse_from(["nc2regions", "template", "--format", "yaml", "-o", "job.yaml"]);
        if let Commands::Template { output, format } = cli.command {
            assert_eq!(output, Some(PathBuf::from("job.yaml")));
            assert_eq!(format, ConfigFormat::Yaml);
        } else {
            panic!("Expected Template command");
        }
    }

    #[test]
    fn test_completions_command() {
        let cli = Cli::parse_from(["nc2regions", "completions", "bash"]);
        assert!(matches!(cli.command, Commands::Completions { .. }));

        let mut buffer = Vec::new();
        clap_complete::generate(clap_complete::Shell::Bash, &mut Cli::command(), "nc2regions", &mut buffer);
        let script = String::from_utf8(buffer).unwrap();
        assert!(script.contains("nc2regions"));
        assert!(script.contains("collate"));
    }

    /// Test merging a config file with command line values
    #[test]
    fn test_config_file_with_cli_overrides() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("job.json");
        let mut file_config = JobConfig::new("grid", "regions.shp", "out");
        file_config.file_extension = "nc4".to_string();
        std::fs::write(&path, file_config.to_json().unwrap()).unwrap();

        let config = resolve_config(
            Some(&path),
            &RunOverrides {
                shapefile: Some(PathBuf::from("other.shp")),
                regenerate: true,
                id_field: Some("FID".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(config.grid_dir, PathBuf::from("grid"));
        assert_eq!(config.shapefile, PathBuf::from("other.shp"));
        assert_eq!(config.file_extension, "nc4");
        assert_eq!(config.resume, ResumePolicy::Regenerate);
        assert_eq!(config.fields.id.as_deref(), Some("FID"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_config_file() {
        let result = resolve_config(Some(std::path::Path::new("/nonexistent/job.yaml")), &RunOverrides::default());
        assert!(result.is_err());
    }
}
