//! Human-readable disassembly

use crate::insn::{ArithOp, Constant, FrameAssertion, FrameType, Insn, InvokeKind};
use crate::method::{ClassFile, CompiledMethod};
use std::fmt::{self, Write};

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Null => write!(f, "null"),
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Long(v) => write!(f, "{}L", v),
            Constant::Float(v) => write!(f, "{}f", v),
            Constant::Double(v) => write!(f, "{}d", v),
            Constant::Str(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Top => write!(f, "top"),
            FrameType::Int => write!(f, "int"),
            FrameType::Long => write!(f, "long"),
            FrameType::Float => write!(f, "float"),
            FrameType::Double => write!(f, "double"),
            FrameType::Null => write!(f, "null"),
            FrameType::Object(class) => write!(f, "{}", class),
            FrameType::Uninitialized(label) => write!(f, "uninit(L{})", label.0),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for FrameAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locals=[{}] stack=[{}]", join(&self.locals), join(&self.stack))
    }
}

fn arith_name(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "add",
        ArithOp::Sub => "sub",
        ArithOp::Mul => "mul",
        ArithOp::Div => "div",
        ArithOp::Rem => "rem",
        ArithOp::And => "and",
        ArithOp::Or => "or",
        ArithOp::Xor => "xor",
        ArithOp::Shl => "shl",
        ArithOp::Shr => "shr",
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Nop => write!(f, "nop"),
            Insn::Label(l) => write!(f, "L{}:", l.0),
            Insn::Line(n) => write!(f, "line {}", n),
            Insn::Frame(frame) => write!(f, "frame {}", frame),
            Insn::Const(c) => write!(f, "const {}", c),
            Insn::Pop => write!(f, "pop"),
            Insn::Dup => write!(f, "dup"),
            Insn::DupX1 => write!(f, "dup_x1"),
            Insn::Swap => write!(f, "swap"),
            Insn::Load { kind, slot } => write!(f, "{}load {}", kind.prefix(), slot),
            Insn::Store { kind, slot } => write!(f, "{}store {}", kind.prefix(), slot),
            Insn::Arith { op, kind } => write!(f, "{}{}", kind.prefix(), arith_name(*op)),
            Insn::Neg(kind) => write!(f, "{}neg", kind.prefix()),
            Insn::Convert { from, to } => write!(f, "{}2{}", from.prefix(), to.prefix()),
            Insn::Compare(kind) => write!(f, "{}cmp", kind.prefix()),
            Insn::Jump(l) => write!(f, "goto L{}", l.0),
            Insn::If { cond, target } => write!(f, "if{:?} L{}", cond, target.0),
            Insn::IfCmp { cond, target } => write!(f, "if_icmp{:?} L{}", cond, target.0),
            Insn::IfNull(l) => write!(f, "ifnull L{}", l.0),
            Insn::IfNonNull(l) => write!(f, "ifnonnull L{}", l.0),
            Insn::Switch { cases, default } => {
                write!(f, "switch {{")?;
                for (value, label) in cases {
                    write!(f, " {} -> L{};", value, label.0)?;
                }
                write!(f, " default -> L{} }}", default.0)
            }
            Insn::New(class) => write!(f, "new {}", class),
            Insn::CheckCast(class) => write!(f, "checkcast {}", class),
            Insn::GetField { owner, name, ty } => write!(f, "getfield {}.{}: {}", owner, name, ty),
            Insn::PutField { owner, name, ty } => write!(f, "putfield {}.{}: {}", owner, name, ty),
            Insn::Invoke { kind, method } => {
                let mnemonic = match kind {
                    InvokeKind::Static => "invokestatic",
                    InvokeKind::Virtual => "invokevirtual",
                    InvokeKind::Constructor => "invokespecial",
                };
                write!(f, "{} {}", mnemonic, method)
            }
            Insn::MakeClosure { method, captured } => {
                write!(f, "closure {} captured={}", method, captured)
            }
            Insn::InvokeClosure { sig } => write!(f, "invokeclosure {}", sig),
            Insn::MonitorEnter => write!(f, "monitorenter"),
            Insn::MonitorExit => write!(f, "monitorexit"),
            Insn::Throw => write!(f, "throw"),
            Insn::Return(Some(kind)) => write!(f, "{}return", kind.prefix()),
            Insn::Return(None) => write!(f, "return"),
        }
    }
}

/// Disassemble one method
pub fn disassemble_method(method: &CompiledMethod) -> String {
    let mut out = String::new();
    let mut flags = Vec::new();
    if method.is_static {
        flags.push("static");
    }
    if method.is_synchronized {
        flags.push("synchronized");
    }
    if method.is_synthetic {
        flags.push("synthetic");
    }
    for flag in flags {
        out.push_str(flag);
        out.push(' ');
    }
    let _ = writeln!(
        out,
        "{}{} [stack={}, locals={}]",
        method.name, method.sig, method.max_stack, method.max_locals
    );
    if let Some(generic) = &method.generic_signature {
        let _ = writeln!(out, "  // signature {}", generic);
    }
    if !method.throws.is_empty() {
        let _ = writeln!(out, "  // throws {}", method.throws.join(", "));
    }

    for (_, insn) in method.code.iter() {
        match insn {
            Insn::Label(_) => {
                let _ = writeln!(out, "{}", insn);
            }
            _ => {
                let _ = writeln!(out, "    {}", insn);
            }
        }
    }

    for h in &method.handlers {
        let _ = writeln!(
            out,
            "  catch {} L{}..L{} -> L{}",
            h.catch_type.as_deref().unwrap_or("*"),
            h.start.0,
            h.end.0,
            h.handler.0
        );
    }
    for var in &method.local_vars {
        let _ = writeln!(
            out,
            "  local {} {}: {} L{}..L{}",
            var.slot, var.name, var.ty, var.start.0, var.end.0
        );
    }
    out
}

/// Disassemble a whole class
pub fn disassemble_class(class: &ClassFile) -> String {
    let mut out = String::new();
    let _ = write!(out, "class {}", class.name);
    if let Some(superclass) = &class.superclass {
        let _ = write!(out, " extends {}", superclass);
    }
    out.push('\n');
    for field in &class.fields {
        let _ = writeln!(out, "  field {}: {}", field.name, field.ty);
    }
    for method in &class.methods {
        out.push('\n');
        out.push_str(&disassemble_method(method));
    }
    out
}
