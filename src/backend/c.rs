use anyhow::{bail, Error};
use itertools::Itertools;
use log::{debug, info, warn};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use super::{check_lowering, Backend, BackendConfig, BackendError};
use crate::common::{NodeId, VarId};
use crate::graph::Op;
use crate::schedule::Annotation;
use crate::tree::{LeafNode, LoopNode, LoopTree, NodeKind, TreeRef};
use crate::utils::{indent, ToWriteFmt};

const CLI_FLAGS: [&str; 3] = ["-std=gnu99", "-O3", "-o"];
const LINK_FLAGS: [&str; 1] = ["-lm"];

/// Emits a loop tree as a C program, builds it with clang, and times the binary.
#[derive(Debug, Clone, Default)]
pub struct ClangBackend {
    config: BackendConfig,
}

pub struct BuiltArtifact {
    binary_path: PathBuf,
    // Deleted when the artifact is dropped.
    _dir: TempDir,
}

/// The C expressions bounding one variable at the current point of emission.
#[derive(Clone)]
struct VarRange {
    lo: String,
    hi: String,
    /// The range's length when it is the same on every iteration of the enclosing loops.
    exact_len: Option<u64>,
}

struct Emitter<'a> {
    tree: &'a LoopTree,
    ranges: Vec<VarRange>,
}

pub fn clang_path() -> Option<String> {
    match std::env::var("CLANG") {
        Ok(v) => Some(v),
        Err(_) => None,
    }
}

impl ClangBackend {
    pub fn new(config: BackendConfig) -> Self {
        ClangBackend { config }
    }

    pub fn compiler_path(&self) -> String {
        self.config
            .compiler
            .clone()
            .or_else(clang_path)
            .unwrap_or_else(|| String::from("clang"))
    }

    pub fn emit<W: fmt::Write>(&self, tree: &LoopTree, out: &mut W) -> fmt::Result {
        let graph = tree.graph();
        writeln!(out, "#include <math.h>")?;
        writeln!(out, "#include <stdio.h>")?;
        writeln!(out, "#include <stdlib.h>")?;
        writeln!(out, "#include <time.h>")?;
        writeln!(out)?;
        for (id, _) in graph.nodes() {
            writeln!(out, "static float buf{}[{}];", id.0, graph.volume(id))?;
        }
        writeln!(out)?;

        writeln!(out, "static void init_inputs(void) {{")?;
        for (id, node) in graph.nodes() {
            if node.op.is_input() {
                writeln!(
                    out,
                    "  for (long i = 0; i < {}; i++) buf{}[i] = (float)(rand() % 4);",
                    graph.volume(id),
                    id.0
                )?;
            }
        }
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "static void kernel(void) {{")?;
        for (id, node) in graph.nodes() {
            if graph.reduces(id) {
                let identity = match node.op {
                    Op::Add => "0.0f",
                    Op::Mul => "1.0f",
                    Op::Max => "-INFINITY",
                    Op::Min => "INFINITY",
                    _ => unreachable!("{} does not reduce", node.op),
                };
                writeln!(
                    out,
                    "  for (long i = 0; i < {}; i++) buf{}[i] = {identity};",
                    graph.volume(id),
                    id.0
                )?;
            }
        }
        let mut emitter = Emitter::new(tree);
        for root in tree.roots() {
            emitter.emit_node(*root, 1, out)?;
        }
        writeln!(out, "}}")?;
        writeln!(out)?;

        writeln!(out, "int main(int argc, char **argv) {{")?;
        writeln!(out, "  long steps = argc > 1 ? atol(argv[1]) : 1;")?;
        writeln!(out, "  srand((unsigned)({}ULL));", self.config.seed)?;
        writeln!(out, "  init_inputs();")?;
        writeln!(out, "  struct timespec start, end;")?;
        writeln!(out, "  clock_gettime(CLOCK_MONOTONIC, &start);")?;
        writeln!(out, "  for (long s = 0; s < steps; s++) kernel();")?;
        writeln!(out, "  clock_gettime(CLOCK_MONOTONIC, &end);")?;
        writeln!(out, "  long secs = end.tv_sec - start.tv_sec;")?;
        writeln!(out, "  long nsecs = end.tv_nsec - start.tv_nsec;")?;
        writeln!(out, "  if (nsecs < 0) {{ secs -= 1; nsecs += 1000000000L; }}")?;
        writeln!(out, "  printf(\"cpu: %lds %ldns\\n\", secs, nsecs);")?;
        writeln!(out, "  double checksum = 0.0;")?;
        for output in graph.outputs() {
            writeln!(
                out,
                "  for (long i = 0; i < {}; i++) checksum += buf{}[i];",
                graph.volume(*output),
                output.0
            )?;
        }
        writeln!(out, "  printf(\"checksum: %f\\n\", checksum);")?;
        writeln!(out, "  return 0;")?;
        writeln!(out, "}}")
    }

    pub fn build(&self, tree: &LoopTree) -> Result<BuiltArtifact, BackendError> {
        let dir = tempdir()?;
        let source_path = dir.path().join("main.c");
        let binary_path = dir.path().join("a.out");

        let source_file = std::fs::File::create(&source_path)?;
        self.emit(tree, &mut ToWriteFmt(source_file))
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "failed to write generated source",
                )
            })?;

        let clang_proc = Command::new(self.compiler_path())
            .args(CLI_FLAGS)
            .arg(binary_path.to_string_lossy().to_string())
            .arg(source_path.to_string_lossy().to_string())
            .args(LINK_FLAGS)
            .output()?;

        let stderr = String::from_utf8_lossy(&clang_proc.stderr).into_owned();
        if !clang_proc.status.success() {
            return Err(BackendError::Build {
                status: clang_proc.status.to_string(),
                stderr,
            });
        }
        if !stderr.is_empty() {
            // We still want to see warnings.
            warn!("{stderr}");
        }
        debug!("Built {}", binary_path.display());
        Ok(BuiltArtifact {
            binary_path,
            _dir: dir,
        })
    }
}

impl Backend for ClangBackend {
    fn lower_and_run(&self, tree: &LoopTree) -> Result<f64, BackendError> {
        check_lowering(tree)?;
        let artifact = self.build(tree)?;
        let steps = self.config.steps.max(1);
        let mut best = Duration::MAX;
        for _ in 0..self.config.samples.max(1) {
            let time = artifact.measure_time(steps)?;
            debug!("Sample runtime result {}s", time.as_secs_f64());
            best = best.min(time);
        }
        let secs = best.as_secs_f64() / f64::from(steps);
        info!("Best compiled runtime: {secs}s");
        Ok(secs)
    }
}

impl BuiltArtifact {
    /// Runs the kernel `steps` times and returns the total runtime of that loop.
    pub fn measure_time(&self, steps: u32) -> Result<Duration, BackendError> {
        let output = Command::new(&self.binary_path)
            .arg(steps.to_string())
            .output()?;
        if !output.status.success() {
            return Err(BackendError::Execution(Error::msg(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        parse_benchmark_output(first_line).map_err(BackendError::Execution)
    }
}

impl<'a> Emitter<'a> {
    fn new(tree: &'a LoopTree) -> Self {
        let ranges = tree
            .graph()
            .vars()
            .iter()
            .map(|v| VarRange {
                lo: String::from("0"),
                hi: v.size.to_string(),
                exact_len: Some(u64::from(v.size.get())),
            })
            .collect();
        Emitter { tree, ranges }
    }

    fn emit_node<W: fmt::Write>(&mut self, r: TreeRef, depth: usize, out: &mut W) -> fmt::Result {
        match self.tree.node(r).kind() {
            NodeKind::Loop(l) => self.emit_loop(r, l, depth, out),
            NodeKind::Leaf(leaf) => self.emit_leaf(leaf, depth, out),
        }
    }

    fn emit_loop<W: fmt::Write>(
        &mut self,
        r: TreeRef,
        l: &LoopNode,
        depth: usize,
        out: &mut W,
    ) -> fmt::Result {
        let ind = indent(depth);
        let v = l.var.index();
        let outer = self.ranges[v].clone();
        match l.annotation {
            Annotation::None => {}
            Annotation::Vectorize => writeln!(out, "{ind}#pragma clang loop vectorize(enable)")?,
            Annotation::Unroll => writeln!(out, "{ind}#pragma unroll")?,
        }
        writeln!(
            out,
            "{ind}for (long i{r} = 0; i{r} < {}; i{r}++) {{",
            l.extent()
        )?;
        writeln!(
            out,
            "{ind}  const long lo{r} = {} + i{r} * {};",
            outer.lo, l.stride
        )?;
        // Every iteration is a full tile unless the enclosing range can be shorter.
        if outer.exact_len == Some(l.coverage()) && l.tail == 0 {
            self.ranges[v] = VarRange {
                lo: format!("lo{r}"),
                hi: format!("(lo{r} + {})", l.stride),
                exact_len: Some(l.stride),
            };
        } else {
            writeln!(out, "{ind}  if (lo{r} >= {}) break;", outer.hi)?;
            writeln!(
                out,
                "{ind}  const long hi{r} = {hi} < lo{r} + {s} ? {hi} : lo{r} + {s};",
                hi = outer.hi,
                s = l.stride
            )?;
            self.ranges[v] = VarRange {
                lo: format!("lo{r}"),
                hi: format!("hi{r}"),
                exact_len: None,
            };
        }
        for child in self.tree.children(r) {
            self.emit_node(*child, depth + 1, out)?;
        }
        writeln!(out, "{ind}}}")?;
        self.ranges[v] = outer;
        Ok(())
    }

    fn emit_leaf<W: fmt::Write>(&self, leaf: &LeafNode, depth: usize, out: &mut W) -> fmt::Result {
        let graph = self.tree.graph();
        let node = graph.node(leaf.node);
        let args = node
            .inputs
            .iter()
            .map(|i| self.element(*i))
            .collect_vec();
        let value = match node.op {
            Op::Input => unreachable!("input nodes are never computed"),
            Op::Add => format!("({})", args.join(" + ")),
            Op::Mul => format!("({})", args.join(" * ")),
            Op::Sub => format!("({} - {})", args[0], args[1]),
            Op::Div => format!("({} / {})", args[0], args[1]),
            Op::Max => fold_calls("fmaxf", &args),
            Op::Min => fold_calls("fminf", &args),
            Op::Neg => format!("(-{})", args[0]),
            Op::Exp => format!("expf({})", args[0]),
            Op::Copy => args[0].clone(),
        };
        let dest = self.element(leaf.node);
        let ind = indent(depth);
        if graph.reduces(leaf.node) {
            match node.op {
                Op::Add => writeln!(out, "{ind}{dest} += {value};"),
                Op::Mul => writeln!(out, "{ind}{dest} *= {value};"),
                Op::Max => writeln!(out, "{ind}{dest} = fmaxf({dest}, {value});"),
                Op::Min => writeln!(out, "{ind}{dest} = fminf({dest}, {value});"),
                _ => unreachable!("{} does not reduce", node.op),
            }
        } else {
            writeln!(out, "{ind}{dest} = {value};")
        }
    }

    /// The C lvalue for the element of `tensor` at the current point.
    fn element(&self, tensor: NodeId) -> String {
        let graph = self.tree.graph();
        let mut vars = graph.node(tensor).vars.iter();
        let offset = match vars.next() {
            None => String::from("0"),
            Some(first) => vars.fold(self.lo(*first), |acc, v| {
                format!("({acc}) * {} + {}", graph.var(*v).size, self.lo(*v))
            }),
        };
        format!("buf{}[{offset}]", tensor.0)
    }

    fn lo(&self, var: VarId) -> String {
        self.ranges[var.index()].lo.clone()
    }
}

fn fold_calls(func: &str, args: &[String]) -> String {
    let mut iter = args.iter().rev();
    let last = iter.next().cloned().unwrap_or_default();
    iter.fold(last, |acc, a| format!("{func}({a}, {acc})"))
}

fn parse_benchmark_output(output: &str) -> anyhow::Result<Duration> {
    let mut outs = output.split_whitespace();
    if outs.next() != Some("cpu:") {
        bail!("expected \"cpu:\" prefix in benchmark output");
    }

    let s_str = outs
        .next()
        .ok_or("invalid output format")
        .map_err(Error::msg)?;
    let ns_str = outs
        .next()
        .ok_or("invalid output format")
        .map_err(Error::msg)?;
    if !s_str.ends_with('s') || !ns_str.ends_with("ns") {
        bail!("invalid time unit");
    }

    let s = s_str.trim_end_matches('s');
    let ns = ns_str.trim_end_matches("ns");
    Ok(Duration::new(s.parse::<u64>()?, ns.parse::<u32>()?))
}
