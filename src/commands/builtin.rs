//! Built-in commands.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use anyhow::Context;
use regex::Regex;

use super::{preload_resources, Command, CommandHost, CommandRegistry, CommandType};

/// Build the default registry. `overrides` replaces a command's preload list
/// by command name.
pub fn registry(overrides: &HashMap<String, Vec<String>>) -> CommandRegistry {
    let base = CommandType::root();
    let configure = |mut ty: CommandType| {
        if let Some(preloads) = overrides.get(ty.name()) {
            ty.set_preloads(preloads.clone());
        }
        ty
    };

    let mut registry = CommandRegistry::new();
    registry.register("test", Arc::new(Test { ty: configure(Test::definition(&base)) }), None);
    registry.register("rspec", Arc::new(RSpec { ty: configure(RSpec::definition(&base)) }), None);
    registry.register("cucumber", Arc::new(Cucumber { ty: configure(base.derive("cucumber")) }), None);
    registry.register("rake", Arc::new(Rake { ty: configure(base.derive("rake")) }), None);
    registry.register("console", Arc::new(Console { ty: configure(base.derive("console")) }), Some("c"));
    registry.register("generate", Arc::new(Generate { ty: configure(base.derive("generate")) }), Some("g"));
    registry.register("runner", Arc::new(Runner { ty: configure(base.derive("runner")) }), Some("r"));
    registry
}

// ─── test ────────────────────────────────────────────────────

pub struct Test {
    ty: CommandType,
}

impl Test {
    pub fn definition(parent: &CommandType) -> CommandType {
        parent.derive("test").with_preload("test_helper")
    }
}

fn spec_path() -> &'static Regex {
    static SPEC_PATH: OnceLock<Regex> = OnceLock::new();
    SPEC_PATH.get_or_init(|| Regex::new(r"(^|/)spec(/|$)").expect("static regex"))
}

impl Command for Test {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.prepend_load_path("test");
        preload_resources(&self.ty, host)
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        let args: Vec<String> = if args.is_empty() {
            vec!["test".to_string()]
        } else {
            args.to_vec()
        };

        // Loading a spec here stops the test-unit run, so skip them.
        let (specs, ok_paths): (Vec<String>, Vec<String>) =
            args.into_iter().partition(|path| spec_path().is_match(path));
        if !specs.is_empty() {
            let mut warning = String::from("WARNING: prewarm test does not work on specs; skipping:\n");
            for path in &specs {
                warning.push_str(&format!("  {}\n", path));
            }
            host.warn(&warning);
        }

        host.replace_args(ok_paths.clone());
        for arg in &ok_paths {
            let path = host.expand_path(arg);
            if path.is_dir() {
                let pattern = path.join("**").join("*_test.rb");
                let mut files: Vec<_> = glob::glob(&pattern.to_string_lossy())
                    .with_context(|| format!("bad test pattern for {}", arg))?
                    .filter_map(Result::ok)
                    .collect();
                files.sort();
                for file in files {
                    host.require(&file.to_string_lossy())?;
                }
            } else {
                host.require(&path.to_string_lossy())?;
            }
        }
        Ok(())
    }

    fn env(&self, _tail: &[String]) -> Option<String> {
        Some("test".to_string())
    }

    fn description(&self) -> &str {
        "Execute a Test::Unit test."
    }
}

// ─── rspec ───────────────────────────────────────────────────

pub struct RSpec {
    ty: CommandType,
}

impl RSpec {
    pub fn definition(parent: &CommandType) -> CommandType {
        parent.derive("rspec").with_preload("spec_helper")
    }
}

impl Command for RSpec {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.prepend_load_path("spec");
        host.require_library("rspec/core");
        host.invoke("RSpec::Core::Runner.disable_autorun!");
        preload_resources(&self.ty, host)
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.set_program_name("rspec");
        host.replace_args(args.to_vec());
        host.invoke("exit RSpec::Core::Runner.run(ARGV)");
        Ok(())
    }

    fn env(&self, _tail: &[String]) -> Option<String> {
        Some("test".to_string())
    }

    fn description(&self) -> &str {
        "Execute an RSpec spec."
    }
}

// ─── cucumber ────────────────────────────────────────────────

pub struct Cucumber {
    ty: CommandType,
}

impl Command for Cucumber {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        preload_resources(&self.ty, host)?;
        host.require_library("cucumber");
        Ok(())
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.replace_args(args.to_vec());
        host.invoke("Cucumber::Cli::Main.execute(ARGV)");
        Ok(())
    }

    fn env(&self, _tail: &[String]) -> Option<String> {
        Some("test".to_string())
    }

    fn description(&self) -> &str {
        "Execute a Cucumber feature."
    }
}

// ─── rake ────────────────────────────────────────────────────

pub struct Rake {
    ty: CommandType,
}

impl Command for Rake {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        preload_resources(&self.ty, host)?;
        host.require_library("rake");
        Ok(())
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.replace_args(args.to_vec());
        host.invoke("Rake.application.run");
        Ok(())
    }

    fn description(&self) -> &str {
        "Run a rake task."
    }
}

// ─── console ─────────────────────────────────────────────────

pub struct Console {
    ty: CommandType,
}

impl Command for Console {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    // No preloads: the console loads the application itself.
    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.require_library("rails/commands/console");
        Ok(())
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.replace_args(args.to_vec());
        host.invoke("Rails::Console.start(Rails.application)");
        Ok(())
    }

    /// `console production`, but not `console --sandbox`.
    fn env(&self, tail: &[String]) -> Option<String> {
        tail.first().filter(|first| !first.contains('-')).cloned()
    }

    fn description(&self) -> &str {
        "Start the Rails console."
    }
}

// ─── generate ────────────────────────────────────────────────

pub struct Generate {
    ty: CommandType,
}

impl Command for Generate {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn setup(&self, host: &mut dyn CommandHost) -> anyhow::Result<()> {
        preload_resources(&self.ty, host)?;
        host.invoke("Rails.application.load_generators");
        Ok(())
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.replace_args(args.to_vec());
        host.invoke("require 'rails/commands/generate'");
        Ok(())
    }

    fn description(&self) -> &str {
        "Trigger a Rails generator."
    }
}

// ─── runner ──────────────────────────────────────────────────

pub struct Runner {
    ty: CommandType,
}

fn environment_option() -> &'static Regex {
    static ENVIRONMENT: OnceLock<Regex> = OnceLock::new();
    ENVIRONMENT.get_or_init(|| Regex::new(r"--environment=(\w+)").expect("static regex"))
}

impl Command for Runner {
    fn command_type(&self) -> &CommandType {
        &self.ty
    }

    fn call(&self, args: &[String], host: &mut dyn CommandHost) -> anyhow::Result<()> {
        host.replace_args(args.to_vec());
        host.invoke("APP_PATH = File.expand_path('config/application')");
        host.invoke("require 'rails/commands/runner'");
        Ok(())
    }

    /// Last `--environment=NAME` or `-e NAME` wins.
    fn env(&self, tail: &[String]) -> Option<String> {
        let mut previous: Option<&String> = None;
        for option in tail.iter().rev() {
            if let Some(caps) = environment_option().captures(option) {
                return Some(caps[1].to_string());
            }
            if option == "-e" {
                return previous.cloned();
            }
            previous = Some(option);
        }
        None
    }

    fn description(&self) -> &str {
        "Execute a command with the Rails runner."
    }
}
