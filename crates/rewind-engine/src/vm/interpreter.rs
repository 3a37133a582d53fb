//! Bytecode interpreter
//!
//! Methods are prepared once at class load: the instruction list is
//! flattened, labels are resolved to positions and handler ranges become
//! position intervals. Each call runs in its own [`Frame`] on the calling
//! thread's native stack.

use super::object::ObjectRef;
use super::value::{Closure, Value};
use super::{Vm, VmError, VmResult};
use rewind_bytecode::names::{CONSTRUCTOR, OBJECT_CLASS};
use rewind_bytecode::{
    ArithOp, CompiledMethod, Insn, InvokeKind, LabelId, MethodRef, Signature, Type, ValueKind,
};
use rustc_hash::FxHashMap;
use std::cmp::Ordering;
use std::sync::Arc;

/// A loaded class
pub(crate) struct LoadedClass {
    pub(crate) superclass: Option<String>,
    pub(crate) methods: Vec<Arc<PreparedMethod>>,
}

impl LoadedClass {
    fn find(&self, name: &str, sig: &Signature) -> Option<Arc<PreparedMethod>> {
        self.methods
            .iter()
            .find(|m| m.method.name == name && &m.method.sig == sig)
            .cloned()
    }
}

struct PreparedHandler {
    start: usize,
    end: usize,
    target: usize,
    catch_type: Option<String>,
}

/// Method body ready for execution
pub(crate) struct PreparedMethod {
    pub(crate) method: MethodRef,
    is_static: bool,
    is_synchronized: bool,
    max_locals: usize,
    code: Vec<Insn>,
    labels: FxHashMap<LabelId, usize>,
    handlers: Vec<PreparedHandler>,
}

impl PreparedMethod {
    pub(crate) fn prepare(owner: &str, method: &CompiledMethod) -> VmResult<Self> {
        let code = method.code.to_vec();
        let labels: FxHashMap<LabelId, usize> = code
            .iter()
            .enumerate()
            .filter_map(|(pos, insn)| match insn {
                Insn::Label(l) => Some((*l, pos)),
                _ => None,
            })
            .collect();

        let invalid = |reason: String| VmError::InvalidCode {
            method: format!("{}.{}", owner, method.name),
            reason,
        };
        let resolve = |label: LabelId| {
            labels
                .get(&label)
                .copied()
                .ok_or_else(|| invalid(format!("undefined label L{}", label.0)))
        };

        let mut handlers = Vec::with_capacity(method.handlers.len());
        for h in &method.handlers {
            handlers.push(PreparedHandler {
                start: resolve(h.start)?,
                end: resolve(h.end)?,
                target: resolve(h.handler)?,
                catch_type: h.catch_type.clone(),
            });
        }
        for insn in &code {
            for target in insn.targets() {
                resolve(target)?;
            }
        }

        Ok(Self {
            method: method.reference(owner),
            is_static: method.is_static,
            is_synchronized: method.is_synchronized,
            max_locals: usize::from(method.max_locals.max(method.param_slots())),
            code,
            labels,
            handlers,
        })
    }

    /// Arguments expected, receiver included
    pub(crate) fn arity(&self) -> usize {
        self.method.sig.params.len() + usize::from(!self.is_static)
    }

    fn label(&self, label: LabelId) -> VmResult<usize> {
        self.labels.get(&label).copied().ok_or_else(|| VmError::InvalidCode {
            method: self.method.to_string(),
            reason: format!("undefined label L{}", label.0),
        })
    }
}

enum Flow {
    Next,
    Jump(usize),
    Return(Value),
}

/// Activation of a prepared method
struct Frame<'m> {
    method: &'m PreparedMethod,
    locals: Vec<Value>,
    stack: Vec<Value>,
    /// Monitors entered by this activation, in acquisition order
    monitors: Vec<ObjectRef>,
}

impl<'m> Frame<'m> {
    fn new(method: &'m PreparedMethod, args: Vec<Value>) -> VmResult<Self> {
        if args.len() != method.arity() {
            return Err(VmError::TypeError {
                expected: "matching argument count",
                found: format!("{} arguments for {}", args.len(), method.method),
            });
        }
        let mut locals = vec![Value::Null; method.max_locals];
        let mut slot = 0usize;
        let mut args = args.into_iter();
        if !method.is_static {
            if let Some(receiver) = args.next() {
                locals[0] = receiver;
            }
            slot = 1;
        }
        for (ty, value) in method.method.sig.params.iter().zip(args) {
            locals[slot] = value;
            slot += usize::from(ty.slots());
        }
        Ok(Self {
            method,
            locals,
            stack: Vec::new(),
            monitors: Vec::new(),
        })
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> VmResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| VmError::StackUnderflow(self.method.method.to_string()))
    }

    fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        if self.stack.len() < n {
            return Err(VmError::StackUnderflow(self.method.method.to_string()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn local(&self, slot: u16) -> VmResult<Value> {
        self.locals
            .get(usize::from(slot))
            .cloned()
            .ok_or_else(|| self.bad_slot(slot))
    }

    fn set_local(&mut self, slot: u16, value: Value) -> VmResult<()> {
        let err = self.bad_slot(slot);
        let cell = self.locals.get_mut(usize::from(slot)).ok_or(err)?;
        *cell = value;
        Ok(())
    }

    fn bad_slot(&self, slot: u16) -> VmError {
        VmError::InvalidCode {
            method: self.method.method.to_string(),
            reason: format!("local {} out of range", slot),
        }
    }

    /// Release every monitor still held, newest first
    fn release_monitors(&mut self) {
        while let Some(obj) = self.monitors.pop() {
            if let Err(err) = obj.monitor().exit() {
                tracing::warn!(method = %self.method.method, error = %err, "monitor release failed");
            }
        }
    }
}

fn division_by_zero() -> VmError {
    VmError::Thrown(Value::str("division by zero"))
}

fn null_reference(what: &str) -> VmError {
    VmError::Thrown(Value::str(format!("null {}", what)))
}

macro_rules! integer_op {
    ($op:expr, $a:expr, $b:expr, $shift:expr) => {
        match $op {
            ArithOp::Add => Ok($a.wrapping_add($b)),
            ArithOp::Sub => Ok($a.wrapping_sub($b)),
            ArithOp::Mul => Ok($a.wrapping_mul($b)),
            ArithOp::Div if $b == 0 => Err(division_by_zero()),
            ArithOp::Div => Ok($a.wrapping_div($b)),
            ArithOp::Rem if $b == 0 => Err(division_by_zero()),
            ArithOp::Rem => Ok($a.wrapping_rem($b)),
            ArithOp::And => Ok($a & $b),
            ArithOp::Or => Ok($a | $b),
            ArithOp::Xor => Ok($a ^ $b),
            ArithOp::Shl => Ok($a.wrapping_shl($shift)),
            ArithOp::Shr => Ok($a.wrapping_shr($shift)),
        }
    };
}

macro_rules! float_op {
    ($op:expr, $a:expr, $b:expr) => {
        match $op {
            ArithOp::Add => Ok($a + $b),
            ArithOp::Sub => Ok($a - $b),
            ArithOp::Mul => Ok($a * $b),
            ArithOp::Div => Ok($a / $b),
            ArithOp::Rem => Ok($a % $b),
            other => Err(VmError::TypeError {
                expected: "integer operands",
                found: format!("{:?} on floating point", other),
            }),
        }
    };
}

fn arith(op: ArithOp, kind: ValueKind, a: Value, b: Value) -> VmResult<Value> {
    match kind {
        ValueKind::Int => {
            let (a, b) = (a.as_int()?, b.as_int()?);
            integer_op!(op, a, b, b as u32).map(Value::Int)
        }
        ValueKind::Long => {
            let a = a.as_long()?;
            // shift distances may be ints
            let b = match b {
                Value::Int(v) => i64::from(v),
                other => other.as_long()?,
            };
            integer_op!(op, a, b, b as u32).map(Value::Long)
        }
        ValueKind::Float => {
            let (a, b) = (a.as_float()?, b.as_float()?);
            float_op!(op, a, b).map(Value::Float)
        }
        ValueKind::Double => {
            let (a, b) = (a.as_double()?, b.as_double()?);
            float_op!(op, a, b).map(Value::Double)
        }
        ValueKind::Ref => Err(VmError::TypeError {
            expected: "numeric operands",
            found: "references".to_string(),
        }),
    }
}

fn negate(kind: ValueKind, v: Value) -> VmResult<Value> {
    Ok(match kind {
        ValueKind::Int => Value::Int(v.as_int()?.wrapping_neg()),
        ValueKind::Long => Value::Long(v.as_long()?.wrapping_neg()),
        ValueKind::Float => Value::Float(-v.as_float()?),
        ValueKind::Double => Value::Double(-v.as_double()?),
        ValueKind::Ref => {
            return Err(VmError::TypeError {
                expected: "numeric operand",
                found: v.class_name().to_string(),
            })
        }
    })
}

fn convert(v: Value, from: ValueKind, to: ValueKind) -> VmResult<Value> {
    let (integral, real, is_real) = match from {
        ValueKind::Int => {
            let x = v.as_int()?;
            (i64::from(x), f64::from(x), false)
        }
        ValueKind::Long => {
            let x = v.as_long()?;
            (x, x as f64, false)
        }
        ValueKind::Float => {
            let x = v.as_float()?;
            (x as i64, f64::from(x), true)
        }
        ValueKind::Double => {
            let x = v.as_double()?;
            (x as i64, x, true)
        }
        ValueKind::Ref => return Ok(v),
    };
    Ok(match to {
        ValueKind::Int if is_real => Value::Int(real as i32),
        ValueKind::Int => Value::Int(integral as i32),
        ValueKind::Long => Value::Long(integral),
        ValueKind::Float => Value::Float(real as f32),
        ValueKind::Double => Value::Double(real),
        ValueKind::Ref => v,
    })
}

fn compare(kind: ValueKind, a: Value, b: Value) -> VmResult<Value> {
    let ord = match kind {
        ValueKind::Int => a.as_int()?.cmp(&b.as_int()?),
        ValueKind::Long => a.as_long()?.cmp(&b.as_long()?),
        ValueKind::Float => a.as_float()?.partial_cmp(&b.as_float()?).unwrap_or(Ordering::Less),
        ValueKind::Double => a.as_double()?.partial_cmp(&b.as_double()?).unwrap_or(Ordering::Less),
        ValueKind::Ref if a == b => Ordering::Equal,
        ValueKind::Ref => Ordering::Greater,
    };
    Ok(Value::Int(ord as i32))
}

impl Vm {
    /// Find `method` starting at class `start` and walking up the hierarchy
    fn resolve(&self, method: &MethodRef, start: &str) -> Option<Arc<PreparedMethod>> {
        let mut class = Some(start.to_string());
        while let Some(name) = class {
            let loaded = self.class(&name).ok()?;
            if let Some(found) = loaded.find(&method.name, &method.sig) {
                return Some(found);
            }
            class = loaded.superclass.clone();
        }
        None
    }

    /// Whether `class` is `ancestor` or one of its subclasses
    fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        if ancestor == OBJECT_CLASS || class == ancestor {
            return true;
        }
        let mut current = self.class(class).ok().and_then(|c| c.superclass.clone());
        while let Some(name) = current {
            if name == ancestor {
                return true;
            }
            current = self.class(&name).ok().and_then(|c| c.superclass.clone());
        }
        false
    }

    /// Call `method`, dispatching on `receiver_class` when given
    ///
    /// Bytecode wins over natives. A constructor with no implementation is
    /// a no-op.
    pub(crate) fn call(
        &self,
        method: &MethodRef,
        receiver_class: Option<&str>,
        args: Vec<Value>,
    ) -> VmResult<Value> {
        let found = match receiver_class {
            Some(class) => self
                .resolve(method, class)
                .or_else(|| self.resolve(method, &method.owner)),
            None => self.resolve(method, &method.owner),
        };
        if let Some(prepared) = found {
            return self.execute(&prepared, args);
        }
        if let Some(native) = self.native(&method.owner, &method.name) {
            return native(self, args);
        }
        if method.name == CONSTRUCTOR {
            return Ok(Value::Null);
        }
        Err(VmError::NoSuchMethod(method.to_string()))
    }

    /// Run a prepared method, holding its monitor if it is synchronized
    pub(crate) fn execute(&self, method: &Arc<PreparedMethod>, args: Vec<Value>) -> VmResult<Value> {
        let lock = if method.is_synchronized {
            Some(if method.is_static {
                self.class_monitor(&method.method.owner)
            } else {
                args.first()
                    .ok_or_else(|| null_reference("receiver"))?
                    .as_object()?
                    .clone()
            })
        } else {
            None
        };

        if let Some(obj) = &lock {
            obj.monitor().enter();
        }
        let result = Frame::new(method, args).and_then(|mut frame| {
            let result = self.run(&mut frame);
            frame.release_monitors();
            result
        });
        if let Some(obj) = &lock {
            obj.monitor().exit()?;
        }
        result
    }

    fn run(&self, frame: &mut Frame<'_>) -> VmResult<Value> {
        let method = frame.method;
        let mut pc = 0usize;
        loop {
            let Some(insn) = method.code.get(pc) else {
                return Err(VmError::InvalidCode {
                    method: method.method.to_string(),
                    reason: "fell off the end of the code".to_string(),
                });
            };
            match self.step(frame, insn) {
                Ok(Flow::Next) => pc += 1,
                Ok(Flow::Jump(target)) => pc = target,
                Ok(Flow::Return(value)) => return Ok(value),
                Err(VmError::Thrown(exception)) => match self.find_handler(method, pc, &exception) {
                    Some(target) => {
                        frame.stack.clear();
                        frame.push(exception);
                        pc = target;
                    }
                    None => return Err(VmError::Thrown(exception)),
                },
                Err(other) => return Err(other),
            }
        }
    }

    fn find_handler(&self, method: &PreparedMethod, pc: usize, exception: &Value) -> Option<usize> {
        method
            .handlers
            .iter()
            .find(|h| {
                h.start <= pc
                    && pc < h.end
                    && h.catch_type
                        .as_deref()
                        .map_or(true, |catch| self.is_subclass(exception.class_name(), catch))
            })
            .map(|h| h.target)
    }

    fn step(&self, frame: &mut Frame<'_>, insn: &Insn) -> VmResult<Flow> {
        let method = frame.method;
        match insn {
            Insn::Nop | Insn::Label(_) | Insn::Line(_) | Insn::Frame(_) => {}

            Insn::Const(c) => frame.push(Value::from_constant(c)),
            Insn::Pop => {
                frame.pop()?;
            }
            Insn::Dup => {
                let top = frame.pop()?;
                frame.push(top.clone());
                frame.push(top);
            }
            Insn::DupX1 => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a.clone());
                frame.push(b);
                frame.push(a);
            }
            Insn::Swap => {
                let a = frame.pop()?;
                let b = frame.pop()?;
                frame.push(a);
                frame.push(b);
            }

            Insn::Load { slot, .. } => {
                let value = frame.local(*slot)?;
                frame.push(value);
            }
            Insn::Store { slot, .. } => {
                let value = frame.pop()?;
                frame.set_local(*slot, value)?;
            }

            Insn::Arith { op, kind } => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(arith(*op, *kind, a, b)?);
            }
            Insn::Neg(kind) => {
                let v = frame.pop()?;
                frame.push(negate(*kind, v)?);
            }
            Insn::Convert { from, to } => {
                let v = frame.pop()?;
                frame.push(convert(v, *from, *to)?);
            }
            Insn::Compare(kind) => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(compare(*kind, a, b)?);
            }

            Insn::Jump(target) => return Ok(Flow::Jump(method.label(*target)?)),
            Insn::If { cond, target } => {
                let v = frame.pop()?.as_int()?;
                if cond.holds(v.cmp(&0)) {
                    return Ok(Flow::Jump(method.label(*target)?));
                }
            }
            Insn::IfCmp { cond, target } => {
                let b = frame.pop()?.as_int()?;
                let a = frame.pop()?.as_int()?;
                if cond.holds(a.cmp(&b)) {
                    return Ok(Flow::Jump(method.label(*target)?));
                }
            }
            Insn::IfNull(target) => {
                if frame.pop()?.is_null() {
                    return Ok(Flow::Jump(method.label(*target)?));
                }
            }
            Insn::IfNonNull(target) => {
                if !frame.pop()?.is_null() {
                    return Ok(Flow::Jump(method.label(*target)?));
                }
            }
            Insn::Switch { cases, default } => {
                let v = frame.pop()?.as_int()?;
                let target = cases
                    .iter()
                    .find(|(key, _)| *key == v)
                    .map_or(*default, |(_, label)| *label);
                return Ok(Flow::Jump(method.label(target)?));
            }

            Insn::New(class) => {
                let obj = self.new_object(class);
                frame.push(obj);
            }
            Insn::CheckCast(_) => {}
            Insn::GetField { name, ty, .. } => {
                let target = frame.pop()?;
                if target.is_null() {
                    return Err(null_reference("field access"));
                }
                let value = target
                    .as_object()?
                    .get_field(name)
                    .unwrap_or_else(|| Value::default_for_type(ty));
                frame.push(value);
            }
            Insn::PutField { name, .. } => {
                let value = frame.pop()?;
                let target = frame.pop()?;
                if target.is_null() {
                    return Err(null_reference("field access"));
                }
                target.as_object()?.set_field(name.clone(), value);
            }

            Insn::Invoke { kind, method: callee } => {
                let receiver = usize::from(*kind != InvokeKind::Static);
                let args = frame.pop_n(callee.sig.params.len() + receiver)?;
                let result = match kind {
                    InvokeKind::Virtual => {
                        let class = match args.first() {
                            Some(Value::Null) | None => return Err(null_reference("receiver")),
                            Some(recv) => recv.class_name().to_string(),
                        };
                        self.call(callee, Some(&class), args)?
                    }
                    InvokeKind::Static | InvokeKind::Constructor => self.call(callee, None, args)?,
                };
                if callee.sig.ret != Type::Void {
                    frame.push(result);
                }
            }
            Insn::MakeClosure { method: target, captured } => {
                let captured = frame.pop_n(*captured)?;
                self.shared.stats.record_closure();
                frame.push(Value::Closure(Arc::new(Closure {
                    method: target.clone(),
                    captured,
                })));
            }
            Insn::InvokeClosure { sig } => {
                let args = frame.pop_n(sig.params.len())?;
                let closure = frame.pop()?;
                let result = self.call_closure(closure.as_closure()?, args)?;
                if sig.ret != Type::Void {
                    frame.push(result);
                }
            }

            Insn::MonitorEnter => {
                let target = frame.pop()?;
                if target.is_null() {
                    return Err(null_reference("monitor"));
                }
                let obj = target.as_object()?.clone();
                obj.monitor().enter();
                frame.monitors.push(obj);
            }
            Insn::MonitorExit => {
                let target = frame.pop()?;
                if target.is_null() {
                    return Err(null_reference("monitor"));
                }
                let obj = target.as_object()?;
                obj.monitor().exit()?;
                if let Some(pos) = frame.monitors.iter().rposition(|m| Arc::ptr_eq(m, obj)) {
                    frame.monitors.remove(pos);
                }
            }
            Insn::Throw => {
                let exception = frame.pop()?;
                return Err(VmError::Thrown(exception));
            }
            Insn::Return(kind) => {
                let value = match kind {
                    Some(_) => frame.pop()?,
                    None => Value::Null,
                };
                return Ok(Flow::Return(value));
            }
        }
        Ok(Flow::Next)
    }
}
