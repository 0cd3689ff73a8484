//! Build command - build an image from a playbook

use crate::build::{build_from_playbook, Build};
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::{StratumError, StratumResult};
use crate::orchestrator::Application;
use crate::ui::{self, PlaybookProgress, UiContext};

/// Execute the build command
pub async fn execute(args: BuildArgs, app: &Application, plain: bool, debug: bool) -> StratumResult<()> {
    let ctx = UiContext::detect().with_plain_output(plain);

    if !args.playbook.is_file() {
        return Err(StratumError::validation(
            "/playbook",
            format!("no such file: {}", args.playbook.display()),
        ));
    }

    let defaults = build_defaults(app.config(), debug);
    let mut build = build_from_playbook(&args.playbook, defaults).await?;
    apply_overrides(&mut build, args);

    let label = build.target_image.clone().unwrap_or_default();
    ui::intro(&ctx, &format!("Building {}", label));

    let progress = PlaybookProgress::new(&ctx, &label);
    let result = app.build(build, &|line| progress.on_line(line)).await;
    progress.finish();

    match result {
        Ok(build) => {
            let id = build.build_id.as_deref().unwrap_or("?");
            ui::step_info(
                &ctx,
                &format!("{} cached layer(s)", build.layers.iter().filter(|l| l.cached).count()),
            );
            ui::outro_success(&ctx, &format!("Image '{}' built (build {})", label, id));
            Ok(())
        }
        Err(e) => {
            if e.is_build_failure() {
                let failed = format!("{}-failed", label);
                ui::step_error_detail(&ctx, "Build failed, progress saved into", &failed);
                ui::remark(&ctx, "Run `stratum get-logs` to see the output");
            }
            ui::outro_error(&ctx, &format!("Building '{}' failed", label));
            Err(e)
        }
    }
}

/// New build carrying the configured defaults
fn build_defaults(config: &Config, debug: bool) -> Build {
    let mut build = Build::new();
    build.builder_name = config.build.builder.clone();
    build.cache_tasks = config.build.cache_tasks;
    build.layering = config.build.layering;
    build.squash = config.build.squash;
    build.debug = debug;
    build
}

/// Command line values take precedence over playbook variables
fn apply_overrides(build: &mut Build, args: BuildArgs) {
    if let Some(base) = args.base_image {
        build.base_image = Some(base);
    }
    if let Some(target) = args.target_image {
        build.target_image = Some(target);
    }
    if let Some(builder) = args.builder {
        build.builder_name = builder;
    }
    if args.no_cache {
        build.cache_tasks = false;
    }
    if args.no_layering {
        build.layering = false;
    }
    if args.squash {
        build.squash = true;
    }
    if !args.build_volumes.is_empty() {
        build.build_volumes = args.build_volumes;
    }
    if args.build_user.is_some() {
        build.build_user = args.build_user;
    }
    if args.extra_ansible_args.is_some() {
        build.ansible_extra_args = args.extra_ansible_args;
    }
    if args.extra_buildah_from_args.is_some() {
        build.buildah_from_extra_args = args.extra_buildah_from_args;
    }
    if args.python_interpreter.is_some() {
        build.python_interpreter = args.python_interpreter;
    }

    let metadata = &mut build.metadata;
    if args.workdir.is_some() {
        metadata.working_dir = args.workdir;
    }
    metadata.labels.extend(args.label);
    metadata.annotations.extend(args.annotation);
    metadata.env_vars.extend(args.env_vars);
    if args.cmd.is_some() {
        metadata.cmd = args.cmd;
    }
    if args.entrypoint.is_some() {
        metadata.entrypoint = args.entrypoint;
    }
    if args.user.is_some() {
        metadata.user = args.user;
    }
    if !args.ports.is_empty() {
        metadata.ports = args.ports;
    }
    if !args.runtime_volumes.is_empty() {
        metadata.volumes = args.runtime_volumes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{Cli, Commands};
    use clap::Parser;

    fn build_args(argv: &[&str]) -> BuildArgs {
        let mut full = vec!["stratum", "build"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Commands::Build(args) => args,
            _ => panic!("expected Build command"),
        }
    }

    #[test]
    fn defaults_come_from_config() {
        let mut config = Config::default();
        config.build.cache_tasks = false;
        config.build.squash = true;

        let build = build_defaults(&config, true);
        assert!(!build.cache_tasks);
        assert!(build.layering);
        assert!(build.squash);
        assert!(build.debug);
        assert_eq!(build.builder_name, "buildah");
    }

    #[test]
    fn overrides_replace_playbook_values() {
        let mut build = Build::new();
        build.base_image = Some("fedora:39".to_string());
        build.metadata.labels.insert("a".to_string(), "1".to_string());
        build.metadata.ports = vec!["80".to_string()];

        let args = build_args(&[
            "site.yaml",
            "fedora:40",
            "my-app",
            "--no-layering",
            "-l",
            "b=2",
            "--cmd",
            "/usr/bin/app",
            "--python-interpreter",
            "/usr/bin/python3",
        ]);
        apply_overrides(&mut build, args);

        assert_eq!(build.base_image.as_deref(), Some("fedora:40"));
        assert_eq!(build.target_image.as_deref(), Some("my-app"));
        assert!(!build.layering);
        assert!(build.cache_tasks);
        assert_eq!(build.metadata.labels.len(), 2);
        assert_eq!(build.metadata.ports, vec!["80"]);
        assert_eq!(build.metadata.cmd.as_deref(), Some("/usr/bin/app"));
        assert_eq!(build.python_interpreter.as_deref(), Some("/usr/bin/python3"));
    }

    #[test]
    fn missing_positionals_keep_playbook_values() {
        let mut build = Build::new();
        build.base_image = Some("fedora:39".to_string());
        build.target_image = Some("from-playbook".to_string());

        apply_overrides(&mut build, build_args(&["site.yaml"]));
        assert_eq!(build.base_image.as_deref(), Some("fedora:39"));
        assert_eq!(build.target_image.as_deref(), Some("from-playbook"));
    }
}
