use super::{AppIdentity, StageDef, StageName};
use crate::component::{elevated, run, system_packages, workdir, StageAction};
use crate::config::BuildConfig;
use crate::install::{StepAction, VENV_PYTHON};
use crate::runtime::RuntimeSpec;

/// Debug tooling and developer packages, then an auto-reloading server.
pub(super) fn definition(config: &BuildConfig) -> StageDef {
    let dev = &config.development;

    let mut tooling = Vec::new();
    if !dev.system_tools.is_empty() {
        tooling.push(system_packages(dev.system_tools.iter()));
    }
    if !dev.python_tools.is_empty() {
        tooling.push(run(
            StepAction::Pip(dev.python_tools.clone()).gated_command(VENV_PYTHON),
        ));
    }

    let mut actions = Vec::new();
    if !tooling.is_empty() {
        actions.push(elevated("development tooling", tooling));
    }
    actions.push(StageAction::Op(workdir(config.image.app_root.clone())));

    StageDef {
        name: StageName::Development,
        identity: AppIdentity::from_config(config),
        app_root: config.image.app_root.clone(),
        actions,
        runtime: Some(RuntimeSpec::development(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Op;

    #[test]
    fn test_tooling_is_one_elevated_block() {
        let def = definition(&BuildConfig::default());
        def.validate().unwrap();
        let StageAction::Elevated { ops, .. } = &def.actions[0] else {
            panic!("expected elevated block first");
        };
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], Op::SystemPackages(tools) if tools.contains(&"vim".to_string())));
        assert!(ops[1].to_string().contains("debugpy"));
        assert!(ops[1].to_string().contains("$VIRTUAL_ENV/bin/python"));
    }

    #[test]
    fn test_empty_tool_lists_skip_elevation() {
        let mut config = BuildConfig::default();
        config.development.system_tools.clear();
        config.development.python_tools.clear();
        let def = definition(&config);
        def.validate().unwrap();
        assert!(def
            .actions
            .iter()
            .all(|a| matches!(a, StageAction::Op(_))));
    }
}
