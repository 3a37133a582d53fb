//! Fluent method construction
//!
//! `MethodBuilder` appends instructions to a [`CompiledMethod`] and computes
//! `max_locals` and `max_stack` when finished.

use crate::insn::{ArithOp, Cond, Constant, FrameAssertion, Insn, InvokeKind, LabelId};
use crate::method::{CompiledMethod, ExceptionHandler, LocalVariable};
use crate::names::CONSTRUCTOR;
use crate::types::{MethodRef, Signature, Type, ValueKind};
use crate::verify::{verify_method, VerifyError};

/// Builder for compiled methods
pub struct MethodBuilder {
    method: CompiledMethod,
}

impl MethodBuilder {
    /// Start a method with the given name and signature
    pub fn new(name: impl Into<String>, sig: Signature, is_static: bool) -> Self {
        Self {
            method: CompiledMethod::new(name, sig, is_static),
        }
    }

    /// Method under construction
    pub fn method(&self) -> &CompiledMethod {
        &self.method
    }

    /// Allocate a label without placing it
    pub fn new_label(&mut self) -> LabelId {
        self.method.new_label()
    }

    /// Append a raw instruction
    pub fn emit(&mut self, insn: Insn) -> &mut Self {
        self.method.code.push(insn);
        self
    }

    // ===== Flags & metadata =====

    /// Mark the method synchronized
    pub fn synchronized(&mut self) -> &mut Self {
        self.method.is_synchronized = true;
        self
    }

    /// Mark the method synthetic
    pub fn synthetic(&mut self) -> &mut Self {
        self.method.is_synthetic = true;
        self
    }

    /// Declare a thrown exception type
    pub fn throws(&mut self, class: impl Into<String>) -> &mut Self {
        self.method.throws.push(class.into());
        self
    }

    /// Set the generic signature string
    pub fn generic_signature(&mut self, sig: impl Into<String>) -> &mut Self {
        self.method.generic_signature = Some(sig.into());
        self
    }

    /// Reserve local slots beyond what the code touches
    pub fn max_locals(&mut self, n: u16) -> &mut Self {
        self.method.max_locals = self.method.max_locals.max(n);
        self
    }

    /// Register an exception region
    pub fn handler(
        &mut self,
        start: LabelId,
        end: LabelId,
        handler: LabelId,
        catch_type: Option<&str>,
    ) -> &mut Self {
        self.method.handlers.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type: catch_type.map(str::to_string),
        });
        self
    }

    /// Name a local slot over a label range
    pub fn local_var(
        &mut self,
        name: impl Into<String>,
        slot: u16,
        ty: Type,
        start: LabelId,
        end: LabelId,
    ) -> &mut Self {
        self.method.local_vars.push(LocalVariable {
            name: name.into(),
            slot,
            ty,
            start,
            end,
        });
        self
    }

    // ===== Pseudo instructions =====

    /// Place a label
    pub fn label(&mut self, label: LabelId) -> &mut Self {
        self.emit(Insn::Label(label))
    }

    /// Mark the source line
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.emit(Insn::Line(line))
    }

    /// Insert a frame assertion
    pub fn frame(&mut self, frame: FrameAssertion) -> &mut Self {
        self.emit(Insn::Frame(frame))
    }

    // ===== Constants & stack =====

    /// Push a constant
    pub fn constant(&mut self, c: Constant) -> &mut Self {
        self.emit(Insn::Const(c))
    }

    /// Push an int
    pub fn iconst(&mut self, v: i32) -> &mut Self {
        self.constant(Constant::Int(v))
    }

    /// Push a long
    pub fn lconst(&mut self, v: i64) -> &mut Self {
        self.constant(Constant::Long(v))
    }

    /// Push a double
    pub fn dconst(&mut self, v: f64) -> &mut Self {
        self.constant(Constant::Double(v))
    }

    /// Push a string
    pub fn sconst(&mut self, v: impl Into<String>) -> &mut Self {
        self.constant(Constant::Str(v.into()))
    }

    /// Push null
    pub fn null(&mut self) -> &mut Self {
        self.constant(Constant::Null)
    }

    /// Pop
    pub fn pop(&mut self) -> &mut Self {
        self.emit(Insn::Pop)
    }

    /// Duplicate the top value
    pub fn dup(&mut self) -> &mut Self {
        self.emit(Insn::Dup)
    }

    /// Duplicate the top value below the second
    pub fn dup_x1(&mut self) -> &mut Self {
        self.emit(Insn::DupX1)
    }

    /// Swap the two top values
    pub fn swap(&mut self) -> &mut Self {
        self.emit(Insn::Swap)
    }

    // ===== Locals =====

    /// Push a local
    pub fn load(&mut self, kind: ValueKind, slot: u16) -> &mut Self {
        self.emit(Insn::Load { kind, slot })
    }

    /// Pop into a local
    pub fn store(&mut self, kind: ValueKind, slot: u16) -> &mut Self {
        self.emit(Insn::Store { kind, slot })
    }

    // ===== Arithmetic =====

    /// Binary arithmetic
    pub fn arith(&mut self, op: ArithOp, kind: ValueKind) -> &mut Self {
        self.emit(Insn::Arith { op, kind })
    }

    /// Addition
    pub fn add(&mut self, kind: ValueKind) -> &mut Self {
        self.arith(ArithOp::Add, kind)
    }

    /// Subtraction
    pub fn sub(&mut self, kind: ValueKind) -> &mut Self {
        self.arith(ArithOp::Sub, kind)
    }

    /// Multiplication
    pub fn mul(&mut self, kind: ValueKind) -> &mut Self {
        self.arith(ArithOp::Mul, kind)
    }

    /// Division
    pub fn div(&mut self, kind: ValueKind) -> &mut Self {
        self.arith(ArithOp::Div, kind)
    }

    /// Kind conversion
    pub fn convert(&mut self, from: ValueKind, to: ValueKind) -> &mut Self {
        self.emit(Insn::Convert { from, to })
    }

    // ===== Control flow =====

    /// Unconditional jump
    pub fn jump(&mut self, target: LabelId) -> &mut Self {
        self.emit(Insn::Jump(target))
    }

    /// Branch on an int against zero
    pub fn if_cond(&mut self, cond: Cond, target: LabelId) -> &mut Self {
        self.emit(Insn::If { cond, target })
    }

    /// Branch on two ints
    pub fn if_cmp(&mut self, cond: Cond, target: LabelId) -> &mut Self {
        self.emit(Insn::IfCmp { cond, target })
    }

    /// Branch if null
    pub fn if_null(&mut self, target: LabelId) -> &mut Self {
        self.emit(Insn::IfNull(target))
    }

    /// Branch if not null
    pub fn if_non_null(&mut self, target: LabelId) -> &mut Self {
        self.emit(Insn::IfNonNull(target))
    }

    /// Table switch
    pub fn switch(&mut self, cases: Vec<(i32, LabelId)>, default: LabelId) -> &mut Self {
        self.emit(Insn::Switch { cases, default })
    }

    // ===== Objects & calls =====

    /// Allocate an instance
    pub fn new_object(&mut self, class: impl Into<String>) -> &mut Self {
        self.emit(Insn::New(class.into()))
    }

    /// Checked cast
    pub fn check_cast(&mut self, class: impl Into<String>) -> &mut Self {
        self.emit(Insn::CheckCast(class.into()))
    }

    /// Read a field
    pub fn get_field(&mut self, owner: &str, name: &str, ty: Type) -> &mut Self {
        self.emit(Insn::GetField {
            owner: owner.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    /// Write a field
    pub fn put_field(&mut self, owner: &str, name: &str, ty: Type) -> &mut Self {
        self.emit(Insn::PutField {
            owner: owner.to_string(),
            name: name.to_string(),
            ty,
        })
    }

    /// Static call
    pub fn invoke_static(&mut self, owner: &str, name: &str, sig: Signature) -> &mut Self {
        self.emit(Insn::Invoke {
            kind: InvokeKind::Static,
            method: MethodRef::new(owner, name, sig),
        })
    }

    /// Virtual call
    pub fn invoke_virtual(&mut self, owner: &str, name: &str, sig: Signature) -> &mut Self {
        self.emit(Insn::Invoke {
            kind: InvokeKind::Virtual,
            method: MethodRef::new(owner, name, sig),
        })
    }

    /// Constructor call with the given parameter types
    pub fn invoke_constructor(&mut self, owner: &str, params: Vec<Type>) -> &mut Self {
        self.emit(Insn::Invoke {
            kind: InvokeKind::Constructor,
            method: MethodRef::new(owner, CONSTRUCTOR, Signature::new(params, Type::Void)),
        })
    }

    /// Create a closure over the first `captured` parameters of `method`
    pub fn make_closure(&mut self, method: MethodRef, captured: usize) -> &mut Self {
        self.emit(Insn::MakeClosure { method, captured })
    }

    /// Call a closure
    pub fn invoke_closure(&mut self, sig: Signature) -> &mut Self {
        self.emit(Insn::InvokeClosure { sig })
    }

    // ===== Synchronization & exceptions =====

    /// Acquire a monitor
    pub fn monitor_enter(&mut self) -> &mut Self {
        self.emit(Insn::MonitorEnter)
    }

    /// Release a monitor
    pub fn monitor_exit(&mut self) -> &mut Self {
        self.emit(Insn::MonitorExit)
    }

    /// Throw
    pub fn throw(&mut self) -> &mut Self {
        self.emit(Insn::Throw)
    }

    /// Return
    pub fn ret(&mut self, kind: Option<ValueKind>) -> &mut Self {
        self.emit(Insn::Return(kind))
    }

    // ===== Finishing =====

    fn settle_locals(&mut self) {
        let used = self
            .method
            .code
            .iter()
            .filter_map(|(_, insn)| insn.local_access())
            .map(|(slot, kind)| slot + kind.slots())
            .max()
            .unwrap_or(0);
        self.method.max_locals = self.method.max_locals.max(used);
        self.method.sync_label_counter();
    }

    /// Verify the method and fill in `max_locals` and `max_stack`
    pub fn finish(mut self) -> Result<CompiledMethod, VerifyError> {
        self.settle_locals();
        self.method.max_stack = verify_method(&self.method)?;
        Ok(self.method)
    }

    /// Fill in `max_locals` but skip verification
    pub fn finish_unchecked(mut self) -> CompiledMethod {
        self.settle_locals();
        self.method
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_computes_locals() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![Type::Int], Type::Long), true);
        b.lconst(3).store(ValueKind::Long, 1).load(ValueKind::Long, 1).ret(Some(ValueKind::Long));
        let method = b.finish().unwrap();
        assert_eq!(method.max_locals, 3);
        assert_eq!(method.max_stack, 1);
        assert_eq!(method.code.len(), 4);
    }

    #[test]
    fn test_labels_are_fresh() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![], Type::Void), true);
        let a = b.new_label();
        let c = b.new_label();
        assert_ne!(a, c);
        b.label(a).jump(c).label(c).ret(None);
        let method = b.finish().unwrap();
        assert!(method.next_label > c.0);
    }

    #[test]
    fn test_handler_registration() {
        let mut b = MethodBuilder::new("f", Signature::new(vec![], Type::Void), true);
        let (start, end, handler) = (b.new_label(), b.new_label(), b.new_label());
        b.label(start)
            .null()
            .throw()
            .label(end)
            .label(handler)
            .pop()
            .ret(None)
            .handler(start, end, handler, None);
        let method = b.finish().unwrap();
        assert_eq!(method.handlers.len(), 1);
        assert_eq!(method.handlers[0].catch_type, None);
    }
}
