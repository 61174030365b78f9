use super::{ActionCommon, Runnable};
use crate::error::{Result, StackError};
use crate::expr;
use crate::io;
use crate::process;
use crate::unit::Unit;
use crate::value;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Inline(String),
    /// Paths relative to the unit directory; each may be an expression.
    Files(Vec<String>),
}

/// `gomplate:` / `pongo2:` template rendering.
#[derive(Debug)]
pub struct TemplateAction {
    engine: &'static str,
    source: TemplateSource,
}

impl TemplateAction {
    pub fn parse(key: &'static str, map: &Map<String, Value>) -> Result<Self> {
        let raw = map.get(key).unwrap_or(&Value::Null);
        let source = match raw {
            Value::String(s) => TemplateSource::Inline(s.clone()),
            Value::Array(items) => TemplateSource::Files(
                items
                    .iter()
                    .map(|v| value::expect_str(v, key).map(str::to_string))
                    .collect::<Result<_>>()?,
            ),
            other => {
                return Err(StackError::BadAction(format!(
                    "{key} must be a template string or a list of paths, found {}",
                    value::type_name(other)
                )))
            }
        };
        Ok(Self {
            engine: key,
            source,
        })
    }

    pub fn engine(&self) -> &'static str {
        self.engine
    }

    fn load_source(&self, unit: &Unit) -> Result<String> {
        match &self.source {
            TemplateSource::Inline(s) => Ok(s.clone()),
            TemplateSource::Files(paths) => {
                let view = unit.view();
                let mut out = String::new();
                for raw in paths {
                    let rel = expr::compute_string(unit.runtime(), raw, &view)
                        .unwrap_or_else(|| raw.clone());
                    let path = crate::paths::absolutize(unit.workdir(), &rel);
                    out.push_str(&io::read_path_contents(&path)?);
                }
                Ok(out)
            }
        }
    }
}

impl Runnable for TemplateAction {
    fn run(&self, unit: &Arc<Unit>, common: &ActionCommon) -> Result<Option<String>> {
        let source = self.load_source(unit)?;
        let ctx = common.context.resolve(unit)?;
        let rendered = process::with_timeout(
            self.engine,
            unit.workdir(),
            common.run_timeout_or_default(unit),
            move || render(&source, &ctx),
        )?;
        Ok(Some(rendered))
    }
}

/// Render `source` with `ctx` as the template context.
pub fn render(source: &str, ctx: &Value) -> Result<String> {
    let mut env = minijinja::Environment::new();
    env.set_keep_trailing_newline(true);
    env.add_filter("toYaml", to_yaml);
    env.add_filter("toJson", to_json);
    Ok(env.render_str(source, ctx)?)
}

fn to_yaml(v: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
    serde_yaml::to_string(&v).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })
}

fn to_json(v: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
    serde_json::to_string(&v).map_err(|e| {
        minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_context() {
        let out = render("host={{ db.host }}:{{ db.port }}\n", &json!({"db": {"host": "h", "port": 5}}))
            .unwrap();
        assert_eq!(out, "host=h:5\n");
    }

    #[test]
    fn yaml_filter() {
        let out = render("{{ items | toYaml }}", &json!({"items": {"a": [1, 2]}})).unwrap();
        assert_eq!(out, "a:\n- 1\n- 2\n");
    }

    #[test]
    fn syntax_error_is_reported() {
        assert!(matches!(
            render("{{ unclosed", &json!({})),
            Err(StackError::Template(_))
        ));
    }

    #[test]
    fn source_shapes() {
        let m = |v: Value| v.as_object().cloned().unwrap();
        let t = TemplateAction::parse("gomplate", &m(json!({"gomplate": "x"}))).unwrap();
        assert_eq!(t.source, TemplateSource::Inline("x".into()));
        let t = TemplateAction::parse("pongo2", &m(json!({"pongo2": ["a.tmpl", "dir"]}))).unwrap();
        assert_eq!(t.engine(), "pongo2");
        assert_eq!(
            t.source,
            TemplateSource::Files(vec!["a.tmpl".into(), "dir".into()])
        );
        assert!(TemplateAction::parse("gomplate", &m(json!({"gomplate": 1}))).is_err());
        assert!(TemplateAction::parse("gomplate", &m(json!({"gomplate": [1]}))).is_err());
    }
}
