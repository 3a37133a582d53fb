//! Resumable-method transform
//!
//! Lowers methods that call the await primitive into code that runs on a
//! plain stack machine with a future library. The pass runs per method:
//!
//! 1. **Analysis**: reconstruct the frame before every instruction
//!    (`analyzer`, `frame`)
//! 2. **Location**: find the await calls and number them (`locate`)
//! 3. **Monitors**: make the implicit monitor of a synchronized method
//!    explicit (`monitors`)
//! 4. **Construction**: move allocations whose constructor runs after a
//!    suspension point down to the constructor (`construct`)
//! 5. **Capture**: assign continuation parameters to live values (`capture`)
//! 6. **Synthesis**: emit the entry procedure and the continuation (`synth`)
//! 7. **Call sites**: replace the surface vocabulary with the future library
//!    (`callsite`)
//!
//! [`AsyncTransformer`] drives the pass for single methods and whole
//! classes.

pub mod analyzer;
pub mod callsite;
pub mod capture;
pub mod construct;
pub mod diagnostics;
pub mod error;
pub mod frame;
pub mod locate;
pub mod monitors;
pub mod names;
pub mod options;
pub mod synth;

pub use capture::{CapturePlan, CapturedVariable, SlotMapping};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Location, TracingSink};
pub use error::{AnalysisError, TransformError, TransformErrorKind};
pub use frame::{AbstractFrame, FrameValue, Origin, Slot, ValueDescriptor};
pub use locate::SuspensionSite;
pub use names::NameCounter;
pub use options::{ConfigError, TransformOptions};

use analyzer::analyze;
use callsite::{check_parameters, map_signature, needs_transform, rewrite_call_sites};
use construct::{hazards, rewrite_constructions};
use locate::{line_of, locate};
use monitors::lower_synchronized;
use rewind_bytecode::{ClassFile, CompiledMethod, MethodRef};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use synth::{finish_method, synthesize};

/// The continuation split off a transformed method
#[derive(Debug, Clone)]
pub struct ContinuationMethod {
    /// Local slot of the resume state parameter
    pub dispatch_param: u16,
    /// Local slot of the resumed-future parameter
    pub future_param: u16,
    /// Captured variables, in parameter order
    pub captured: Vec<CapturedVariable>,
    /// The emitted method
    pub method: CompiledMethod,
}

/// Result of transforming one method
#[derive(Debug, Clone)]
pub struct TransformedMethod {
    /// Replacement for the original method
    pub entry: CompiledMethod,
    /// Continuation, when the method has suspension points
    pub continuation: Option<ContinuationMethod>,
    /// Closure bodies that return the marker type and need the transform too
    pub closure_targets: Vec<MethodRef>,
    /// Number of suspension points
    pub sites: usize,
}

/// Outcome of [`AsyncTransformer::transform_method`]
#[derive(Debug, Clone)]
pub enum TransformOutcome {
    /// Nothing to do; the method must be kept as is
    Unchanged,
    /// The method was rewritten
    Transformed(TransformedMethod),
}

impl TransformOutcome {
    /// Whether the method was left alone
    pub fn is_unchanged(&self) -> bool {
        matches!(self, TransformOutcome::Unchanged)
    }
}

/// Summary of [`AsyncTransformer::transform_class`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassReport {
    /// Methods rewritten
    pub transformed: usize,
    /// Methods left alone
    pub unchanged: usize,
    /// Names of the appended continuation methods
    pub continuations: Vec<String>,
    /// Closure targets that could not be found in the class
    pub missing_closure_targets: usize,
}

/// The transform pass
///
/// Holds no per-method state, so one transformer can serve several threads.
pub struct AsyncTransformer {
    options: TransformOptions,
    names: Arc<NameCounter>,
    sink: Arc<dyn DiagnosticSink>,
}

impl AsyncTransformer {
    /// Transformer with the process-wide name counter, logging diagnostics
    pub fn new(options: TransformOptions) -> Self {
        Self {
            options,
            names: NameCounter::global(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Use a dedicated name counter
    pub fn with_names(mut self, names: Arc<NameCounter>) -> Self {
        self.names = names;
        self
    }

    /// Send diagnostics to `sink`
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Options in effect
    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    /// Transform one method declared in `owner`
    pub fn transform_method(
        &self,
        owner: &str,
        method: &CompiledMethod,
    ) -> Result<TransformOutcome, TransformError> {
        self.transform_method_with(owner, method, &mut FxHashSet::default())
    }

    /// Transform every method of `class` in place
    ///
    /// Transformed methods are replaced by their entry procedures and the
    /// continuations are appended. Closure bodies returning the marker type
    /// are processed before the remaining methods.
    pub fn transform_class(&self, class: &mut ClassFile) -> Result<ClassReport, TransformError> {
        let mut taken: FxHashSet<String> = class.methods.iter().map(|m| m.name.clone()).collect();
        let mut report = ClassReport::default();
        let mut continuations = Vec::new();
        let mut done = vec![false; class.methods.len()];
        let mut queue: VecDeque<usize> = (0..class.methods.len()).collect();

        while let Some(i) = queue.pop_front() {
            if done[i] {
                continue;
            }
            done[i] = true;

            let outcome = self.transform_method_with(&class.name, &class.methods[i], &mut taken)?;
            let transformed = match outcome {
                TransformOutcome::Unchanged => {
                    report.unchanged += 1;
                    continue;
                }
                TransformOutcome::Transformed(t) => t,
            };

            for target in &transformed.closure_targets {
                match self.find_closure_target(class, target) {
                    Some(j) => {
                        if !done[j] {
                            queue.push_front(j);
                        }
                    }
                    None => {
                        report.missing_closure_targets += 1;
                        self.sink.warn(
                            &Location::new(class.name.clone(), class.methods[i].name.clone(), None),
                            &format!("closure target {} not found in class", target),
                        );
                    }
                }
            }

            class.methods[i] = transformed.entry;
            report.transformed += 1;
            if let Some(continuation) = transformed.continuation {
                report.continuations.push(continuation.method.name.clone());
                continuations.push(continuation.method);
            }
        }

        class.methods.extend(continuations);
        for field in &mut class.fields {
            field.ty = self.options.map_type(&field.ty);
        }
        tracing::debug!(
            class = %class.name,
            transformed = report.transformed,
            unchanged = report.unchanged,
            "transformed class"
        );
        Ok(report)
    }

    fn find_closure_target(&self, class: &ClassFile, target: &MethodRef) -> Option<usize> {
        if target.owner != class.name {
            return None;
        }
        class.methods.iter().position(|m| {
            m.name == target.name && map_signature(&m.sig, &self.options) == target.sig
        })
    }

    fn continuation_name(&self, owner: &str, base: &str, taken: &mut FxHashSet<String>) -> String {
        loop {
            let name = self
                .names
                .next_name(owner, base, &self.options.continuation_suffix);
            if taken.insert(name.clone()) {
                return name;
            }
        }
    }

    fn transform_method_with(
        &self,
        owner: &str,
        method: &CompiledMethod,
        taken: &mut FxHashSet<String>,
    ) -> Result<TransformOutcome, TransformError> {
        let options = &self.options;
        let fail = |kind: TransformErrorKind, line: Option<u32>| {
            TransformError::new(owner, method.name.clone(), line.or_else(|| method.first_line()), kind)
        };
        let analysis_failed = |e: AnalysisError, body: &CompiledMethod| {
            let line = e.at().and_then(|id| line_of(body, id));
            fail(e.into(), line)
        };

        check_parameters(method, options).map_err(|kind| fail(kind, None))?;
        if !needs_transform(method, options) {
            return Ok(TransformOutcome::Unchanged);
        }

        // abstract and native methods only need their types mapped
        if method.code.is_empty() {
            let mut entry = method.clone();
            rewrite_call_sites(&mut entry, options);
            tracing::debug!(owner, method = %method.name, "mapped signature of method without code");
            return Ok(TransformOutcome::Transformed(TransformedMethod {
                entry,
                continuation: None,
                closure_targets: Vec::new(),
                sites: 0,
            }));
        }

        let frames = analyze(owner, method, options.visit_budget)
            .map_err(|e| analysis_failed(e, method))?;
        let sites = locate(owner, method, &frames, options, Some(self.sink.as_ref()));

        if sites.is_empty() {
            let mut entry = method.clone();
            let report = rewrite_call_sites(&mut entry, options);
            finish_method(&mut entry).map_err(|kind| fail(kind, None))?;
            tracing::debug!(owner, method = %method.name, "rewrote call sites only");
            return Ok(TransformOutcome::Transformed(TransformedMethod {
                entry,
                continuation: None,
                closure_targets: report.closure_targets,
                sites: 0,
            }));
        }

        if !options.is_future_like(&method.sig.ret) {
            return Err(fail(
                TransformErrorKind::NotFutureReturning {
                    ret: method.sig.ret.to_string(),
                },
                sites[0].line,
            ));
        }

        let mut working = method.clone();
        let mut frames = frames;
        let mut sites = sites;
        if lower_synchronized(owner, &mut working).is_some() {
            frames = analyze(owner, &working, options.visit_budget)
                .map_err(|e| analysis_failed(e, &working))?;
            sites = locate(owner, &working, &frames, options, None);
        }
        if !hazards(&sites).is_empty() {
            let rewritten = rewrite_constructions(&mut working, &frames, &sites)
                .map_err(|kind| fail(kind, sites[0].line))?;
            tracing::debug!(owner, method = %method.name, rewritten, "deferred allocations");
            let frames = analyze(owner, &working, options.visit_budget)
                .map_err(|e| analysis_failed(e, &working))?;
            sites = locate(owner, &working, &frames, options, None);
        }

        let site_line = |kind: &TransformErrorKind, sites: &[SuspensionSite]| {
            let resume_id = match kind {
                TransformErrorKind::MonitorNotInLocal { resume_id }
                | TransformErrorKind::MissingCapture { resume_id, .. }
                | TransformErrorKind::UndecidedCapture { resume_id, .. }
                | TransformErrorKind::UnknownResumeState(resume_id) => Some(*resume_id),
                _ => None,
            };
            resume_id
                .and_then(|id| sites.iter().find(|s| s.resume_id == id))
                .or_else(|| sites.first())
                .and_then(|s| s.line)
        };

        let entry_frame = AbstractFrame::entry(owner, &working);
        let plan = capture::plan_captures(&working, &entry_frame, &mut sites)
            .map_err(|kind| {
                let line = site_line(&kind, &sites);
                fail(kind, line)
            })?;

        let name = self.continuation_name(owner, &method.name, taken);
        let out = synthesize(owner, &working, &sites, &plan, &name, options).map_err(|kind| {
            let line = site_line(&kind, &sites);
            fail(kind, line)
        })?;

        let mut entry = out.entry;
        let mut body = out.continuation;
        rewrite_call_sites(&mut entry, options);
        let report = rewrite_call_sites(&mut body, options);
        finish_method(&mut entry).map_err(|kind| fail(kind, None))?;
        finish_method(&mut body).map_err(|kind| fail(kind, None))?;

        if options.verify_output {
            for emitted in [&entry, &body] {
                analyze(owner, emitted, options.visit_budget).map_err(|e| {
                    fail(
                        TransformErrorKind::InvalidOutput(format!("{}: {}", emitted.name, e)),
                        None,
                    )
                })?;
            }
        }

        let captured = plan
            .variables
            .into_iter()
            .map(|mut v| {
                v.ty = options.map_type(&v.ty);
                v
            })
            .collect();

        tracing::debug!(
            owner,
            method = %method.name,
            continuation = %body.name,
            sites = sites.len(),
            "transformed method"
        );

        Ok(TransformOutcome::Transformed(TransformedMethod {
            entry,
            continuation: Some(ContinuationMethod {
                dispatch_param: out.dispatch_param,
                future_param: out.future_param,
                captured,
                method: body,
            }),
            closure_targets: report.closure_targets,
            sites: sites.len(),
        }))
    }
}
