//! Inspect command - show the record of a build

use crate::build::Build;
use crate::cli::args::InspectArgs;
use crate::error::StratumResult;
use crate::orchestrator::Application;
use crate::ui::{self, UiContext};

/// Execute the inspect command
pub async fn execute(args: InspectArgs, app: &Application) -> StratumResult<()> {
    let build = app.inspect(args.build_id.as_deref()).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&build)?);
    } else {
        print_build(&UiContext::detect(), &build);
    }
    Ok(())
}

fn print_build(ctx: &UiContext, build: &Build) {
    let or_dash = |v: Option<&str>| v.unwrap_or("-").to_string();

    ui::intro(ctx, &format!("Build {}", build.build_id.as_deref().unwrap_or("?")));
    ui::key_value(ctx, "State", build.state.as_str());
    ui::key_value(ctx, "Playbook", &or_dash(build.playbook_path.as_deref().and_then(|p| p.to_str())));
    ui::key_value(ctx, "Base image", &or_dash(build.base_image.as_deref()));
    ui::key_value(ctx, "Target image", &or_dash(build.target_image.as_deref()));
    ui::key_value(ctx, "Builder", &build.builder_name);
    ui::key_value(ctx, "Working container", &or_dash(build.build_container.as_deref()));
    ui::key_value(ctx, "Python interpreter", &or_dash(build.python_interpreter.as_deref()));
    ui::key_value(ctx, "Final image", &or_dash(build.final_layer_id.as_deref()));
    ui::key_value_status(ctx, "Cache", on_off(build.cache_tasks), build.cache_tasks);
    ui::key_value_status(ctx, "Layering", on_off(build.layering), build.layering);

    ui::section(ctx, "Layers");
    for layer in &build.layers {
        if layer.cached {
            ui::step_ok(ctx, &layer.to_string());
        } else {
            ui::step_info(ctx, &layer.to_string());
        }
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}
