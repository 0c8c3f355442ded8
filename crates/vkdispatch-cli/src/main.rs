use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use vkdispatch_compute::discovery::{discover_devices, DeviceInfo};
use vkdispatch_compute::{ComputeDispatcher, InstanceOptions};
use vkdispatch_core::config::{default_config_path, DispatchConfig, ValidationMode, VkdispatchConfig};
use vkdispatch_core::Extent3;

#[derive(Parser)]
#[command(name = "vkdispatch")]
#[command(about = "vkdispatch - run one Vulkan compute shader over an f32 buffer")]
#[command(version)]
struct Cli {
    /// Configuration file path (default: /etc/vkdispatch/vkdispatch.toml, then ./vkdispatch.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Validation layer: auto, on or off
    #[arg(long, global = true)]
    validation: Option<ValidationMode>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a buffer, dispatch the shader once and print the buffer afterwards
    Run {
        #[command(flatten)]
        overrides: RunOverrides,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List Vulkan devices and whether they can run a dispatch
    Devices {
        /// Print the device list as JSON
        #[arg(long)]
        json: bool,
    },
}

/// `run` flags that replace values from the `[dispatch]` config section.
#[derive(Args, Debug, Default)]
struct RunOverrides {
    /// SPIR-V binary or WGSL source
    #[arg(short, long)]
    shader: Option<PathBuf>,

    /// Shader entry point
    #[arg(short, long)]
    entry_point: Option<String>,

    /// Number of f32 elements in the buffer
    #[arg(short = 'n', long)]
    count: Option<usize>,

    /// Initial value of every element
    #[arg(short, long)]
    fill: Option<f32>,

    /// Invocation grid as X,Y,Z (default: count,1,1)
    #[arg(short, long, value_parser = parse_extent)]
    invocations: Option<Extent3>,

    /// Local workgroup size as X,Y,Z; must match the shader
    #[arg(short, long, value_parser = parse_extent)]
    local_size: Option<Extent3>,
}

impl RunOverrides {
    fn apply(self, dispatch: &mut DispatchConfig) {
        if let Some(shader) = self.shader {
            dispatch.shader = shader;
        }
        if let Some(entry_point) = self.entry_point {
            dispatch.entry_point = entry_point;
        }
        if let Some(count) = self.count {
            dispatch.element_count = count;
        }
        if let Some(fill) = self.fill {
            dispatch.fill = fill;
        }
        if self.invocations.is_some() {
            dispatch.invocations = self.invocations;
        }
        if let Some(local_size) = self.local_size {
            dispatch.local_size = local_size;
        }
    }
}

#[derive(Serialize)]
struct RunReport<'a> {
    device: &'a str,
    shader: PathBuf,
    workgroups: Extent3,
    local_size: Extent3,
    output: Vec<f32>,
}

fn main() -> anyhow::Result<()> {
    vkdispatch_common::init_logging();

    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = VkdispatchConfig::load_or_default(&config_path);
    if let Some(mode) = cli.validation {
        config.instance.validation = mode;
    }
    let options = InstanceOptions::from(&config.instance);

    match cli.command {
        Commands::Run { overrides, json } => {
            overrides.apply(&mut config.dispatch);

            let params = config.dispatch.to_params()?;
            info!(
                "running {} over {} elements (grid {}, local size {})",
                params.shader.display(),
                params.element_count(),
                params.invocations,
                params.local_size
            );

            let dispatcher = ComputeDispatcher::new(&params, &options)?;
            let output = dispatcher.read_back()?;

            if json {
                let report = RunReport {
                    device: dispatcher.device_name(),
                    shader: params.shader.clone(),
                    workgroups: dispatcher.workgroups(),
                    local_size: params.local_size,
                    output,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let values: Vec<String> = output.iter().map(|v| v.to_string()).collect();
                println!("{}", values.join(" "));
            }
        }

        Commands::Devices { json } => {
            let devices = discover_devices(&options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else {
                print_devices(&devices);
            }
        }
    }

    Ok(())
}

fn print_devices(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("No Vulkan devices found.");
        return;
    }
    for gpu in devices {
        println!("  Device {}: {}", gpu.index, gpu.device_name);
        println!("    Type:      {:?}", gpu.device_type);
        println!("    Vulkan:    {}", gpu.api_version);
        println!("    VRAM:      {} MB", gpu.device_local_memory / (1024 * 1024));
        println!("    Compute:   queue families {:?}", gpu.compute_queue_families);
        println!(
            "    Workgroup: max {} invocations, {:?}",
            gpu.max_workgroup_invocations, gpu.max_workgroup_size
        );
        println!(
            "    Dispatch:  {}",
            if gpu.supports_dispatch() { "supported" } else { "unsupported" }
        );
        println!();
    }
}

/// Parse `X`, `X,Y` or `X,Y,Z`; missing axes default to 1.
fn parse_extent(s: &str) -> Result<Extent3, String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(format!("expected X[,Y[,Z]], got '{}'", s));
    }
    let mut dims = [1u32; 3];
    for (dim, part) in dims.iter_mut().zip(&parts) {
        *dim = part
            .parse()
            .map_err(|e| format!("invalid dimension '{}': {}", part, e))?;
    }
    Ok(Extent3::from(dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn extent_parsing_fills_missing_axes() {
        assert_eq!(parse_extent("10").unwrap(), Extent3::new(10, 1, 1));
        assert_eq!(parse_extent("8, 8").unwrap(), Extent3::new(8, 8, 1));
        assert_eq!(parse_extent("4,2,3").unwrap(), Extent3::new(4, 2, 3));
        assert!(parse_extent("1,2,3,4").is_err());
        assert!(parse_extent("x").is_err());
    }

    fn parse_run(args: &[&str]) -> (RunOverrides, bool) {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Run { overrides, json } => (overrides, json),
            Commands::Devices { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from(["vkdispatch", "--validation", "off", "run"]).unwrap();
        assert_eq!(cli.validation, Some(ValidationMode::Off));

        let (overrides, json) = parse_run(&[
            "vkdispatch",
            "run",
            "--shader",
            "identity.spv",
            "-n",
            "10",
            "--local-size",
            "1024",
            "--json",
        ]);
        assert_eq!(overrides.shader, Some(PathBuf::from("identity.spv")));
        assert_eq!(overrides.count, Some(10));
        assert_eq!(overrides.local_size, Some(Extent3::linear(1024)));
        assert!(overrides.invocations.is_none());
        assert!(json);
    }

    #[test]
    fn flags_replace_file_values() {
        let mut config = VkdispatchConfig::parse(
            r#"
[dispatch]
shader = "from_file.spv"
entry_point = "file_main"
element_count = 256
fill = 3.0
invocations = [16, 16, 1]
local_size = [8, 8, 1]
"#,
        )
        .unwrap();

        let (overrides, _) = parse_run(&[
            "vkdispatch",
            "run",
            "-s",
            "from_flag.wgsl",
            "-e",
            "flag_main",
            "-n",
            "64",
            "-f",
            "0.5",
            "-i",
            "64",
            "-l",
            "32",
        ]);
        overrides.apply(&mut config.dispatch);

        let params = config.dispatch.to_params().unwrap();
        assert_eq!(params.shader, PathBuf::from("from_flag.wgsl"));
        assert_eq!(params.entry_point, "flag_main");
        assert_eq!(params.data, vec![0.5f32; 64]);
        assert_eq!(params.invocations, Extent3::linear(64));
        assert_eq!(params.local_size, Extent3::linear(32));
        assert_eq!(params.workgroups().unwrap(), Extent3::linear(2));
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let mut config = VkdispatchConfig::parse("[dispatch]
element_count = 5
fill = 2.0
").unwrap();
        RunOverrides::default().apply(&mut config.dispatch);

        let params = config.dispatch.to_params().unwrap();
        assert_eq!(params.data, vec![2.0f32; 5]);
        assert_eq!(params.invocations, Extent3::linear(5));
    }

    #[test]
    fn count_without_invocations_runs_one_invocation_per_element() {
        let mut config = VkdispatchConfig::default();
        let (overrides, _) = parse_run(&["vkdispatch", "run", "-n", "3000"]);
        overrides.apply(&mut config.dispatch);

        let params = config.dispatch.to_params().unwrap();
        assert_eq!(params.invocations, Extent3::new(3000, 1, 1));
        assert_eq!(params.workgroups().unwrap(), Extent3::linear(3));
    }

    #[test]
    fn oversized_count_is_an_error() {
        let mut config = VkdispatchConfig::default();
        let huge = usize::MAX.to_string();
        let (overrides, _) = parse_run(&["vkdispatch", "run", "-n", &huge]);
        overrides.apply(&mut config.dispatch);
        assert!(config.dispatch.to_params().is_err());
    }
}
