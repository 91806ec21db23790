use std::env;
use std::fs;
use std::process::ExitCode;
use std::time::Instant;

use kiln::{Context, ContextDictionary, Dict, FileSystemSource, Options, Renderer, Value};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let templates_dir = if args.len() > 1 { &args[1] } else { "." };
    let template_name = if args.len() > 2 { &args[2] } else { "index" };
    let context_path = args.get(3);

    let context_json = match context_path {
        Some(path) => match read_file(path) {
            Ok(contents) => contents,
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => "{}".to_string(),
    };

    let context = match build_context(&context_json) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("error: invalid context json: {err}");
            return ExitCode::FAILURE;
        }
    };

    let source = FileSystemSource::new(templates_dir);
    let renderer = Renderer::new(Box::new(source), Options::default());

    let start = Instant::now();
    match renderer.render(template_name, &context) {
        Ok(bytes) => {
            let elapsed = start.elapsed();
            eprintln!("rendered `{template_name}` in {elapsed:?}");
            match String::from_utf8(bytes) {
                Ok(text) => {
                    print!("{text}");
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("error: rendered output is not valid utf-8: {err}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(err) => {
            let elapsed = start.elapsed();
            eprintln!("error after {elapsed:?}:\n{err}");
            ExitCode::FAILURE
        }
    }
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|err| format!("reading {path}: {err}"))
}

/// Builds a root `Context` whose `self` scope mirrors a flat JSON object.
/// Nested objects/arrays are carried through as `Value::Dictionary`/
/// `Value::Array`, matching the same shape a host's own scope-variable
/// registration would produce.
fn build_context(json: &str) -> Result<Context, serde_json::Error> {
    let parsed: serde_json::Value = serde_json::from_str(json)?;
    let mut dict = ContextDictionary::new();
    if let serde_json::Value::Object(map) = &parsed {
        for (key, value) in map {
            dict.insert(key.clone(), json_to_value(value));
        }
    }
    let mut ctx = Context::root(Options::default());
    ctx.register("self", dict);
    Ok(ctx)
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => kiln::TRUE_NIL,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::string(s.clone()),
        serde_json::Value::Array(items) => Value::array(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            let mut dict = Dict::default();
            for (key, value) in map {
                dict.insert(key.clone(), json_to_value(value));
            }
            Value::dictionary(dict)
        }
    }
}
