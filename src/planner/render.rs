//! 规划结果的文本渲染（仅供展示，从不回读）

use std::fmt::Write;

use serde_json::Value;

use crate::planner::descriptor::slugify;
use crate::workflow::{parse_task_ref, FlowDefinition, TaskNode};

fn ordered(def: &FlowDefinition) -> Vec<&TaskNode> {
    let order = def.execution_order().unwrap_or_else(|_| def.task_ids());
    order.iter().filter_map(|id| def.task(id)).collect()
}

/// 任务图概要：按执行顺序，每行一个任务及其上游
pub fn render_outline(def: &FlowDefinition) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "flow {} ({} tasks)", def.name, def.tasks.len());
    if let Some(desc) = &def.description {
        let _ = writeln!(out, "  {desc}");
    }
    for (i, task) in ordered(def).into_iter().enumerate() {
        let _ = write!(
            out,
            "  {}. {} [{}/{}]",
            i + 1,
            task.id,
            task.binding.origin_server,
            task.binding.tool_name
        );
        if !task.upstream.is_empty() {
            let _ = write!(out, " <- {}", task.upstream.join(", "));
        }
        out.push('\n');
    }
    out
}

fn py_type(schema: &Value) -> &'static str {
    match schema.get("type").and_then(Value::as_str) {
        Some("string") => "str",
        Some("integer") => "int",
        Some("number") => "float",
        Some("boolean") => "bool",
        _ => "Any",
    }
}

fn py_literal(v: &Value) -> String {
    match v {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        other => other.to_string(),
    }
}

/// 过程式脚本（Python 风格）：每个任务一个函数，流函数按执行顺序调用并收集结果
pub fn render_script(def: &FlowDefinition) -> String {
    let flow_fn = slugify(&def.name);
    let mut out = String::new();
    out.push_str("#!/usr/bin/env python3\n");
    let _ = writeln!(out, "\"\"\"Generated flow: {}\"\"\"\n", def.name);
    out.push_str("from typing import Any\n\n\n");
    out.push_str("def call_tool(server: str, tool: str, params: dict) -> Any:\n");
    out.push_str("    raise NotImplementedError(f\"dispatch {server}/{tool}\")\n\n\n");

    let tasks = ordered(def);
    for task in &tasks {
        let sig: Vec<String> = task
            .parameters
            .iter()
            .map(|(name, schema)| {
                let default = if task.required.contains(name) { "" } else { " = None" };
                format!("{}: {}{}", name, py_type(schema), default)
            })
            .collect();
        let _ = writeln!(out, "def task_{}({}):", task.id, sig.join(", "));
        let _ = writeln!(out, "    \"\"\"{}\"\"\"", task.name.replace("\"\"\"", "'''"));
        let _ = writeln!(
            out,
            "    return call_tool({:?}, {:?}, locals())\n\n",
            task.binding.origin_server, task.binding.tool_name
        );
    }

    let _ = writeln!(out, "def {flow_fn}():");
    if let Some(desc) = &def.description {
        let _ = writeln!(out, "    \"\"\"{}\"\"\"", desc.replace("\"\"\"", "'''"));
    }
    out.push_str("    results = {}\n");
    for task in &tasks {
        let args: Vec<String> = task
            .arguments
            .iter()
            .map(|(k, v)| match v.as_str().and_then(parse_task_ref) {
                Some(r) => format!("{k}=results[{r:?}]"),
                None => format!("{k}={}", py_literal(v)),
            })
            .collect();
        let _ = writeln!(out, "    results[{:?}] = task_{}({})", task.id, task.id, args.join(", "));
    }
    out.push_str("    return results\n\n\n");
    out.push_str("if __name__ == \"__main__\":\n");
    let _ = writeln!(out, "    {flow_fn}()");
    out
}
