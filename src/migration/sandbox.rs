//! Sandboxed execution of migration scripts.
//!
//! Scripts run in a fresh `rhai` engine with hard resource limits. The engine has no file,
//! process or network access, and the only importable module is the set's own `database`
//! module.

use rhai::module_resolvers::{DummyModuleResolver, StaticModuleResolver};
use rhai::{Dynamic, Engine, Map, Module, Scope};
use tracing::debug;

use crate::error::{DbQueueError, MigrationStage};
use crate::migration::files::{MigrationFile, MigrationSet};

/// Separator line between statements in a migration SQL body.
pub const QUERY_DELIMITER: &str = "-- QUERY DELIMITER";
/// Entry point every migration script defines.
pub const ENTRY_POINT: &str = "run_migration";

const MAX_OPERATIONS: u64 = 5_000_000;
const MAX_CALL_LEVELS: usize = 32;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
const MAX_STRING_SIZE: usize = 8 * 1024 * 1024;
const MAX_COLLECTION_SIZE: usize = 100_000;

/// What a migration script produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptOutput {
    pub forward: String,
    pub reverse: Option<String>,
    pub description: Option<String>,
    pub diagram: Option<String>,
    pub load: Option<String>,
}

fn compile_error(file: &str, message: impl std::fmt::Display) -> DbQueueError {
    DbQueueError::migration(MigrationStage::Compile, format!("{file}: {message}"))
}

fn sandbox_engine(dqm: &str) -> Engine {
    let mut engine = Engine::new();
    engine
        .set_max_operations(MAX_OPERATIONS)
        .set_max_call_levels(MAX_CALL_LEVELS)
        .set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH)
        .set_max_string_size(MAX_STRING_SIZE)
        .set_max_array_size(MAX_COLLECTION_SIZE)
        .set_max_map_size(MAX_COLLECTION_SIZE)
        .set_max_modules(4)
        .set_module_resolver(DummyModuleResolver::new());
    let print_label = dqm.to_string();
    engine.on_print(move |text| debug!(dqm = %print_label, "migration script: {text}"));
    let debug_label = dqm.to_string();
    engine.on_debug(move |text, _source, pos| {
        debug!(dqm = %debug_label, "migration script debug at {pos}: {text}");
    });
    engine
}

/// Compile and run one migration script.
///
/// # Errors
/// Every failure here is a `Compile`-stage [`DbQueueError::MigrationError`]: parse errors,
/// runtime errors, exceeded limits, a missing entry point, or a return value without
/// forward SQL.
pub fn run_script(
    set: &MigrationSet,
    file: &MigrationFile,
    engine_name: &str,
    schema: &str,
    dqm: &str,
) -> Result<ScriptOutput, DbQueueError> {
    evaluate(set.shared_module(), set.design(), file, engine_name, schema, dqm)
}

/// [`run_script`] on tokio's blocking pool, so a script spending its whole operation budget
/// does not stall the runtime's worker threads.
///
/// # Errors
/// As [`run_script`]; a panicked or cancelled script task is also a `Compile`-stage error.
pub async fn spawn_script(
    set: &MigrationSet,
    file: &MigrationFile,
    engine_name: &str,
    schema: &str,
    dqm: &str,
) -> Result<ScriptOutput, DbQueueError> {
    let shared_module = set.shared_module().map(str::to_string);
    let design = set.design().to_string();
    let task_file = file.clone();
    let engine_name = engine_name.to_string();
    let schema = schema.to_string();
    let dqm = dqm.to_string();
    tokio::task::spawn_blocking(move || {
        evaluate(
            shared_module.as_deref(),
            &design,
            &task_file,
            &engine_name,
            &schema,
            &dqm,
        )
    })
    .await
    .map_err(|e| compile_error(&file.name, format!("script task failed: {e}")))?
}

fn evaluate(
    shared_module: Option<&str>,
    design: &str,
    file: &MigrationFile,
    engine_name: &str,
    schema: &str,
    dqm: &str,
) -> Result<ScriptOutput, DbQueueError> {
    let mut engine = sandbox_engine(dqm);

    if let Some(source) = shared_module {
        let ast = engine
            .compile(source)
            .map_err(|e| compile_error("database module", e))?;
        let module = Module::eval_ast_as_new(Scope::new(), &ast, &engine)
            .map_err(|e| compile_error("database module", e))?;
        let mut resolver = StaticModuleResolver::new();
        resolver.insert("database", module);
        engine.set_module_resolver(resolver);
    }

    let ast = engine
        .compile(&file.source)
        .map_err(|e| compile_error(&file.name, e))?;
    let value: Dynamic = engine
        .call_fn(
            &mut Scope::new(),
            &ast,
            ENTRY_POINT,
            (
                engine_name.to_string(),
                design.to_string(),
                schema.to_string(),
            ),
        )
        .map_err(|e| compile_error(&file.name, e))?;

    interpret_output(&file.name, value)
}

fn sql_text(file: &str, key: &str, value: Dynamic) -> Result<String, DbQueueError> {
    if value.is_array() {
        let parts = value
            .into_array()
            .map_err(|t| compile_error(file, format!("'{key}' must be text, got {t}")))?;
        let statements = parts
            .into_iter()
            .map(|p| {
                p.into_string()
                    .map_err(|t| compile_error(file, format!("'{key}' items must be text, got {t}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(statements.join(&format!("\n{QUERY_DELIMITER}\n")));
    }
    value
        .into_string()
        .map_err(|t| compile_error(file, format!("'{key}' must be text, got {t}")))
}

fn optional(file: &str, map: &mut Map, key: &str) -> Result<Option<String>, DbQueueError> {
    match map.remove(key) {
        Some(v) if v.is_unit() => Ok(None),
        Some(v) => sql_text(file, key, v).map(|s| (!s.trim().is_empty()).then_some(s)),
        None => Ok(None),
    }
}

fn interpret_output(file: &str, value: Dynamic) -> Result<ScriptOutput, DbQueueError> {
    if value.is_string() || value.is_array() {
        return Ok(ScriptOutput {
            forward: sql_text(file, "forward", value)?,
            ..ScriptOutput::default()
        });
    }
    let type_name = value.type_name();
    let Some(mut map) = value.try_cast::<Map>() else {
        return Err(compile_error(
            file,
            format!("{ENTRY_POINT} returned {type_name}, expected a string or a map"),
        ));
    };
    let forward = optional(file, &mut map, "forward")?
        .ok_or_else(|| compile_error(file, "result has no 'forward' SQL"))?;
    Ok(ScriptOutput {
        forward,
        reverse: optional(file, &mut map, "reverse")?,
        description: optional(file, &mut map, "description")?,
        diagram: optional(file, &mut map, "diagram")?,
        load: optional(file, &mut map, "load")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<ScriptOutput, DbQueueError> {
        let set = MigrationSet::new("app").with_script("app_1.rhai", source)?;
        let file = set.file(1).cloned().ok_or("file").map_err(|e| compile_error("t", e))?;
        run_script(&set, &file, "sqlite", "", "DQM-test-00-SMFC")
    }

    #[test]
    fn string_result_is_forward_sql() -> Result<(), DbQueueError> {
        let out = run(r#"fn run_migration(engine, design, schema) { "CREATE TABLE " + design + "_t (id INT)" }"#)?;
        assert_eq!(out.forward, "CREATE TABLE app_t (id INT)");
        assert_eq!(out.reverse, None);
        Ok(())
    }

    #[test]
    fn map_result_carries_all_parts() -> Result<(), DbQueueError> {
        let out = run(
            r#"
            fn run_migration(engine, design, schema) {
                let sql = if engine == "postgresql" { "SERIAL" } else { "INTEGER" };
                #{
                    forward: ["CREATE TABLE a (id " + sql + ")", "CREATE TABLE b (id INTEGER)"],
                    reverse: "DROP TABLE b;\n-- QUERY DELIMITER\nDROP TABLE a;",
                    description: "two tables",
                    diagram: (),
                }
            }
            "#,
        )?;
        assert_eq!(
            out.forward,
            "CREATE TABLE a (id INTEGER)\n-- QUERY DELIMITER\nCREATE TABLE b (id INTEGER)"
        );
        assert!(out.reverse.is_some());
        assert_eq!(out.description.as_deref(), Some("two tables"));
        assert_eq!(out.diagram, None);
        Ok(())
    }

    #[test]
    fn failures_are_compile_stage() {
        for source in [
            "fn run_migration(e, d, s) { ",
            "fn other() { 1 }",
            "fn run_migration(e, d, s) { 42 }",
            "fn run_migration(e, d, s) { #{ reverse: \"x\" } }",
            "fn run_migration(e, d, s) { loop { } }",
            "import \"/etc/passwd\" as p; fn run_migration(e, d, s) { \"x\" }",
        ] {
            let err = run(source).expect_err(source);
            assert_eq!(err.migration_stage(), Some(MigrationStage::Compile), "{source}");
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn scripts_run_off_the_runtime_thread() -> Result<(), DbQueueError> {
        let set = MigrationSet::new("app")
            .with_script("app_1.rhai", "fn run_migration(e, d, s) { \"SELECT 1\" }")?
            .with_script("app_2.rhai", "fn run_migration(e, d, s) { loop { } }")?;
        let ticker = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        });

        let first = set.file(1).ok_or_else(|| compile_error("t", "missing"))?;
        assert_eq!(spawn_script(&set, first, "sqlite", "", "t").await?.forward, "SELECT 1");
        let runaway = set.file(2).ok_or_else(|| compile_error("t", "missing"))?;
        let err = spawn_script(&set, runaway, "sqlite", "", "t")
            .await
            .expect_err("operation limit");
        assert_eq!(err.migration_stage(), Some(MigrationStage::Compile));
        assert!(ticker.await.is_ok());
        Ok(())
    }

    #[test]
    fn shared_module_is_importable() -> Result<(), DbQueueError> {
        let set = MigrationSet::new("app")
            .with_shared_module("fn table(design) { design + \"_items\" }")
            .with_script(
                "app_1.rhai",
                "fn run_migration(e, d, s) { import \"database\" as db; \"CREATE TABLE \" + db::table(d) }",
            )?;
        let file = set.file(1).cloned().ok_or_else(|| compile_error("t", "missing"))?;
        let out = run_script(&set, &file, "sqlite", "", "DQM-test-00-SMFC")?;
        assert_eq!(out.forward, "CREATE TABLE app_items");
        Ok(())
    }
}
