//! Plan trees with live counters, and their rendering
//!
//! A process executing a query owns a [`PlanNode`] tree whose counters it
//! advances as it runs. A snapshot producer renders the tree through an
//! [`Explainer`] in the format the requester asked for.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{QueryStateError, Result};
use crate::host::Pid;
use crate::stack::ActiveQuery;

/// Output format of rendered plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainFormat {
    Text,
    Xml,
    Json,
    Yaml,
}

impl FromStr for ExplainFormat {
    type Err = QueryStateError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "xml" => Ok(Self::Xml),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            _ => Err(QueryStateError::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for ExplainFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Xml => write!(f, "xml"),
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

/// What to include when rendering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExplainOptions {
    pub format: ExplainFormat,
    pub verbose: bool,
    pub costs: bool,
    pub timing: bool,
    pub buffers: bool,
    pub triggers: bool,
}

impl Default for ExplainOptions {
    fn default() -> Self {
        Self {
            format: ExplainFormat::Text,
            verbose: false,
            costs: false,
            timing: false,
            buffers: false,
            triggers: false,
        }
    }
}

#[derive(Debug, Default)]
struct NodeCounters {
    actual_rows: AtomicU64,
    loops: AtomicU64,
    rows_removed_by_filter: AtomicU64,
    elapsed_us: AtomicU64,
    shared_hit: AtomicU64,
    shared_read: AtomicU64,
}

/// One node of an executing plan
#[derive(Debug)]
pub struct PlanNode {
    node_type: String,
    relation: Option<String>,
    plan_rows: u64,
    startup_cost: f64,
    total_cost: f64,
    filter: Option<String>,
    workers_planned: u32,
    workers: Mutex<Vec<Pid>>,
    counters: NodeCounters,
    children: Vec<Arc<PlanNode>>,
}

impl PlanNode {
    pub fn new(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            relation: None,
            plan_rows: 0,
            startup_cost: 0.0,
            total_cost: 0.0,
            filter: None,
            workers_planned: 0,
            workers: Mutex::new(Vec::new()),
            counters: NodeCounters::default(),
            children: Vec::new(),
        }
    }

    pub fn on(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    pub fn rows(mut self, plan_rows: u64) -> Self {
        self.plan_rows = plan_rows;
        self
    }

    pub fn cost(mut self, startup: f64, total: f64) -> Self {
        self.startup_cost = startup;
        self.total_cost = total;
        self
    }

    pub fn filter(mut self, condition: impl Into<String>) -> Self {
        self.filter = Some(condition.into());
        self
    }

    pub fn workers_planned(mut self, workers: u32) -> Self {
        self.workers_planned = workers;
        self
    }

    pub fn child(mut self, child: Arc<PlanNode>) -> Self {
        self.children.push(child);
        self
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn plan_rows(&self) -> u64 {
        self.plan_rows
    }

    pub fn actual_rows(&self) -> u64 {
        self.counters.actual_rows.load(Ordering::Relaxed)
    }

    pub fn loops(&self) -> u64 {
        self.counters.loops.load(Ordering::Relaxed)
    }

    pub fn rows_removed_by_filter(&self) -> u64 {
        self.counters.rows_removed_by_filter.load(Ordering::Relaxed)
    }

    /// Begin a new loop; the row counter tracks the current loop only
    pub fn start_loop(&self) {
        self.counters.loops.fetch_add(1, Ordering::Relaxed);
        self.counters.actual_rows.store(0, Ordering::Relaxed);
    }

    pub fn add_rows(&self, rows: u64) {
        self.counters.actual_rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_filtered(&self, rows: u64) {
        self.counters.rows_removed_by_filter.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_elapsed(&self, elapsed: Duration) {
        let us = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.counters.elapsed_us.fetch_add(us, Ordering::Relaxed);
    }

    pub fn add_buffers(&self, hit: u64, read: u64) {
        self.counters.shared_hit.fetch_add(hit, Ordering::Relaxed);
        self.counters.shared_read.fetch_add(read, Ordering::Relaxed);
    }

    /// Record a helper process launched on behalf of this node
    pub fn launch_worker(&self, pid: Pid) {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).push(pid);
    }

    pub fn launched_workers(&self) -> Vec<Pid> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Helper pids launched anywhere in this subtree
    pub fn collect_workers(&self) -> Vec<Pid> {
        let mut pids = self.launched_workers();
        for child in &self.children {
            pids.extend(child.collect_workers());
        }
        pids
    }
}

/// Renders a running query's plan
pub trait Explainer: Send + Sync {
    fn explain(&self, query: &ActiveQuery, options: &ExplainOptions) -> Result<String>;
}

/// Default renderer over [`PlanNode`] counters
#[derive(Debug, Default, Clone, Copy)]
pub struct RuntimeExplainer;

impl Explainer for RuntimeExplainer {
    fn explain(&self, query: &ActiveQuery, options: &ExplainOptions) -> Result<String> {
        debug!(format = %options.format, "RuntimeExplainer::explain: called");
        let plan = query.plan();
        match options.format {
            ExplainFormat::Text => Ok(render_text(plan, options)),
            ExplainFormat::Json => {
                let doc = document(plan, options);
                serde_json::to_string_pretty(&doc).map_err(|e| QueryStateError::Internal(e.to_string()))
            }
            ExplainFormat::Yaml => {
                let doc = document(plan, options);
                serde_yaml::to_string(&doc).map_err(|e| QueryStateError::Internal(e.to_string()))
            }
            ExplainFormat::Xml => Ok(render_xml(&document(plan, options))),
        }
    }
}

fn document(plan: &PlanNode, options: &ExplainOptions) -> Value {
    let mut doc = Map::new();
    doc.insert("Plan".to_string(), node_value(plan, options));
    if options.triggers {
        doc.insert("Triggers".to_string(), json!([]));
    }
    Value::Object(doc)
}

fn node_value(node: &PlanNode, options: &ExplainOptions) -> Value {
    let mut map = Map::new();
    map.insert("Node Type".to_string(), json!(node.node_type));
    if let Some(relation) = &node.relation {
        map.insert("Relation Name".to_string(), json!(relation));
    }
    if options.costs {
        map.insert("Startup Cost".to_string(), json!(node.startup_cost));
        map.insert("Total Cost".to_string(), json!(node.total_cost));
        map.insert("Plan Rows".to_string(), json!(node.plan_rows));
    }
    map.insert("Actual Loops".to_string(), json!(node.loops()));
    map.insert("Actual Rows".to_string(), json!(node.actual_rows()));
    if options.timing {
        let ms = node.counters.elapsed_us.load(Ordering::Relaxed) as f64 / 1000.0;
        map.insert("Actual Total Time".to_string(), json!(ms));
    }
    if let Some(filter) = &node.filter {
        map.insert("Filter".to_string(), json!(filter));
        map.insert("Rows Removed by Filter".to_string(), json!(node.rows_removed_by_filter()));
    }
    if options.buffers {
        map.insert(
            "Shared Hit Blocks".to_string(),
            json!(node.counters.shared_hit.load(Ordering::Relaxed)),
        );
        map.insert(
            "Shared Read Blocks".to_string(),
            json!(node.counters.shared_read.load(Ordering::Relaxed)),
        );
    }
    if node.workers_planned > 0 {
        let launched = node.launched_workers();
        map.insert("Workers Planned".to_string(), json!(node.workers_planned));
        map.insert("Workers Launched".to_string(), json!(launched.len()));
        if options.verbose {
            let pids: Vec<u32> = launched.iter().map(|p| p.0).collect();
            map.insert("Workers".to_string(), json!(pids));
        }
    }
    if !node.children.is_empty() {
        let plans: Vec<Value> = node.children.iter().map(|c| node_value(c, options)).collect();
        map.insert("Plans".to_string(), Value::Array(plans));
    }
    Value::Object(map)
}

fn render_text(plan: &PlanNode, options: &ExplainOptions) -> String {
    let mut out = String::new();
    text_node(&mut out, plan, options, 0);
    if options.triggers {
        out.push_str("Triggers: none\n");
    }
    out
}

fn text_node(out: &mut String, node: &PlanNode, options: &ExplainOptions, depth: usize) {
    let indent = "      ".repeat(depth);
    let (head, detail) = if depth == 0 {
        (String::new(), "  ".to_string())
    } else {
        (format!("{}->  ", &indent[..indent.len() - 6]), format!("{}  ", indent))
    };

    let mut line = format!("{}{}", head, node.node_type);
    if let Some(relation) = &node.relation {
        line.push_str(&format!(" on {}", relation));
    }
    if options.costs {
        line.push_str(&format!(
            "  (cost={:.2}..{:.2} rows={})",
            node.startup_cost, node.total_cost, node.plan_rows
        ));
    }
    if options.timing {
        let ms = node.counters.elapsed_us.load(Ordering::Relaxed) as f64 / 1000.0;
        line.push_str(&format!(
            " (Current loop: actual time={:.3} rows={}, loop number={})",
            ms,
            node.actual_rows(),
            node.loops()
        ));
    } else {
        line.push_str(&format!(
            " (Current loop: actual rows={}, loop number={})",
            node.actual_rows(),
            node.loops()
        ));
    }
    out.push_str(&line);
    out.push('\n');

    if let Some(filter) = &node.filter {
        out.push_str(&format!("{}Filter: {}\n", detail, filter));
        out.push_str(&format!(
            "{}Rows Removed by Filter: {}\n",
            detail,
            node.rows_removed_by_filter()
        ));
    }
    if node.workers_planned > 0 {
        let launched = node.launched_workers();
        out.push_str(&format!("{}Workers Planned: {}\n", detail, node.workers_planned));
        out.push_str(&format!("{}Workers Launched: {}\n", detail, launched.len()));
    }
    if options.buffers {
        out.push_str(&format!(
            "{}Buffers: shared hit={} read={}\n",
            detail,
            node.counters.shared_hit.load(Ordering::Relaxed),
            node.counters.shared_read.load(Ordering::Relaxed)
        ));
    }
    for child in &node.children {
        text_node(out, child, options, depth + 1);
    }
}

fn render_xml(doc: &Value) -> String {
    let mut out = String::from("<explain>\n  <Query>\n");
    if let Value::Object(map) = doc {
        xml_fields(&mut out, map, 2);
    }
    out.push_str("  </Query>\n</explain>\n");
    out
}

fn xml_fields(out: &mut String, map: &Map<String, Value>, depth: usize) {
    for (key, value) in map {
        xml_element(out, &key.replace(' ', "-"), value, depth);
    }
}

fn xml_element(out: &mut String, tag: &str, value: &Value, depth: usize) {
    let pad = "  ".repeat(depth);
    match value {
        Value::Object(map) => {
            out.push_str(&format!("{}<{}>\n", pad, tag));
            xml_fields(out, map, depth + 1);
            out.push_str(&format!("{}</{}>\n", pad, tag));
        }
        Value::Array(items) => {
            out.push_str(&format!("{}<{}>\n", pad, tag));
            let item_tag = tag.strip_suffix('s').unwrap_or(tag);
            for item in items {
                xml_element(out, item_tag, item, depth + 1);
            }
            out.push_str(&format!("{}</{}>\n", pad, tag));
        }
        Value::String(s) => out.push_str(&format!("{}<{}>{}</{}>\n", pad, tag, xml_escape(s), tag)),
        other => out.push_str(&format!("{}<{}>{}</{}>\n", pad, tag, other, tag)),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ActiveQuery {
        let scan = Arc::new(PlanNode::new("Seq Scan").on("orders").rows(100).cost(0.0, 35.5).filter("(amount > 10)"));
        scan.start_loop();
        scan.add_rows(40);
        scan.add_filtered(3);
        let gather = PlanNode::new("Gather").rows(100).cost(1000.0, 1200.0).workers_planned(2).child(scan);
        let gather = Arc::new(gather);
        gather.start_loop();
        gather.launch_worker(Pid(501));
        ActiveQuery::new("select * from orders where amount > 10", gather)
    }

    fn options(format: ExplainFormat) -> ExplainOptions {
        ExplainOptions {
            format,
            costs: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<ExplainFormat>().unwrap(), ExplainFormat::Json);
        assert_eq!("yaml".parse::<ExplainFormat>().unwrap(), ExplainFormat::Yaml);
        let err = "html".parse::<ExplainFormat>().unwrap_err();
        assert_eq!(err.code(), "invalid-format");
    }

    #[test]
    fn test_json_has_progress_fields() {
        let rendered = RuntimeExplainer.explain(&sample(), &options(ExplainFormat::Json)).unwrap();
        let doc: Value = serde_json::from_str(&rendered).unwrap();
        let plan = &doc["Plan"];
        assert_eq!(plan["Node Type"], "Gather");
        assert_eq!(plan["Workers Launched"], 1);
        let scan = &plan["Plans"][0];
        assert_eq!(scan["Plan Rows"], 100);
        assert_eq!(scan["Actual Rows"], 40);
        assert_eq!(scan["Rows Removed by Filter"], 3);
    }

    #[test]
    fn test_costs_off_hides_plan_rows() {
        let rendered = RuntimeExplainer
            .explain(&sample(), &ExplainOptions {
                format: ExplainFormat::Json,
                ..Default::default()
            })
            .unwrap();
        assert!(!rendered.contains("Plan Rows"));
        assert!(!rendered.contains("Actual Total Time"));
    }

    #[test]
    fn test_text_rendering() {
        let rendered = RuntimeExplainer.explain(&sample(), &options(ExplainFormat::Text)).unwrap();
        let lines: Vec<&str> = rendered.lines().collect();
        assert!(lines[0].starts_with("Gather  (cost=1000.00..1200.00 rows=100)"));
        assert!(rendered.contains("->  Seq Scan on orders"));
        assert!(rendered.contains("Current loop: actual rows=40, loop number=1"));
        assert!(rendered.contains("Rows Removed by Filter: 3"));
    }

    #[test]
    fn test_xml_and_yaml_rendering() {
        let xml = RuntimeExplainer.explain(&sample(), &options(ExplainFormat::Xml)).unwrap();
        assert!(xml.contains("<Node-Type>Seq Scan</Node-Type>"));
        assert!(xml.contains("<Filter>(amount &gt; 10)</Filter>"));
        assert!(xml.contains("<Plans>"));

        let yaml = RuntimeExplainer.explain(&sample(), &options(ExplainFormat::Yaml)).unwrap();
        assert!(yaml.contains("Node Type: Gather"));
    }

    #[test]
    fn test_collect_workers_walks_subtree() {
        let query = sample();
        assert_eq!(query.plan().collect_workers(), vec![Pid(501)]);
    }
}
