use super::{AppIdentity, StageDef, StageName};
use crate::component::{elevated, env, run, workdir, StageAction};
use crate::config::BuildConfig;
use crate::install::{StepAction, VENV_PYTHON};
use crate::runtime::RuntimeSpec;

/// Process manager install, production env, multi-worker server.
pub(super) fn definition(config: &BuildConfig) -> StageDef {
    let prod = &config.production;
    let install_manager = StepAction::Pip(vec![prod.process_manager.clone()])
        .gated_command(VENV_PYTHON);

    StageDef {
        name: StageName::Production,
        identity: AppIdentity::from_config(config),
        app_root: config.image.app_root.clone(),
        actions: vec![
            elevated("process manager", vec![run(install_manager)]),
            StageAction::Op(env("DEBUG", "false")),
            StageAction::Op(env("WORKERS", prod.workers.to_string())),
            StageAction::Op(workdir(config.image.app_root.clone())),
        ],
        runtime: Some(RuntimeSpec::production(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Op;

    #[test]
    fn test_worker_count_flows_into_env_and_command() {
        let mut config = BuildConfig::default();
        config.production.workers = 8;
        let def = definition(&config);

        assert!(def
            .actions
            .contains(&StageAction::Op(Op::Env("WORKERS".into(), "8".into()))));
        let runtime = def.runtime.unwrap();
        assert!(runtime.command_line().contains("--workers 8"));
    }
}
