//! Call frame builder
//!
//! A [`ForeignFunction`] pairs a resolved symbol with its parsed signature
//! and the language-level shape it is called with. Construction validates
//! the shape against the signature once and precomputes a [`CallPlan`];
//! each call then only marshals, checks, pushes, invokes and pulls.

use crate::contract_violation;
use crate::marshal::{pull_value, MarshalContext, MarshalError};
use crate::resolver::Address;
use crate::safety::{self, ArgState, AssertionError};
use crate::tag::{c_size_of, Assertion, Cmp, Operand, Ownership, Prim, Signature, TypeDesc};
use crate::types::{Class, FnShape, Kind, NativeValue, Value};
use crate::vm::{read_native, FramePool};
use std::ffi::{c_void, CStr};
use std::fmt;
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::trace;

/// The shape a slot declares cannot be called through its tag
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("tag does not describe a function")]
    NotAFunction,

    #[error("shape takes {expected} parameter(s) but the tag maps {found}")]
    Arity { expected: usize, found: usize },

    #[error("{position}: {kind} cannot cross the boundary as native {class}")]
    Incompatible {
        position: String,
        kind: Kind,
        class: Class,
    },

    #[error("`error` may only be the last result")]
    MisplacedError,

    #[error("{position}: {reason}")]
    Unsupported { position: String, reason: String },

    #[error("out-parameters: {0}")]
    OutParams(String),

    #[error("unknown constant `{0}`")]
    UnknownConstant(String),

    #[error("argument {arg} must point to the same type as `{expected}`, found `{found}`")]
    TypeMismatch {
        arg: usize,
        expected: String,
        found: String,
    },
}

/// A foreign call reported failure through its error convention
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{function} failed with code {code}: {message}")]
pub struct ForeignError {
    pub function: String,
    /// Raw return value of the failed call
    pub code: i64,
    /// Diagnostic lookup that produced the message, if one ran
    pub symbol: Option<String>,
    pub message: String,
}

/// Errors returned by [`ForeignFunction::call`]
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Assertion(#[from] AssertionError),

    #[error(transparent)]
    Foreign(#[from] ForeignError),

    #[error(transparent)]
    Marshal(#[from] MarshalError),
}

/// How a native argument relates to the language-level call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgRole {
    /// Takes the value of language parameter n (0-based)
    Param(usize),
    /// Ignored by the caller; filled from its assertions
    Fill,
    /// Address of out-param slot n
    Out(usize),
}

fn is_out_candidate(arg: &TypeDesc) -> bool {
    arg.ownership == Some(Ownership::Initialize)
        && !arg.ignored
        && arg.maps.is_none()
        && arg.printf_format().is_none()
        && matches!(
            arg.pointee(),
            Some(Prim::Bool | Prim::Int { .. } | Prim::Float { .. })
        )
}

/// Number of trailing `+scalar` arguments that can act as out-params
pub(crate) fn trailing_initializers(signature: &Signature) -> usize {
    signature
        .args
        .iter()
        .rev()
        .take_while(|arg| is_out_candidate(arg))
        .count()
}

/// Assign each native argument a role when the last `outs` are out-params
///
/// Returns the roles and the number of language parameters they imply.
pub(crate) fn arg_roles(signature: &Signature, outs: usize) -> (Vec<ArgRole>, usize) {
    let first_out = signature.args.len() - outs.min(signature.args.len());
    let mut next = 0;
    let mut count = 0;
    let roles = signature
        .args
        .iter()
        .enumerate()
        .map(|(i, arg)| {
            let role = if arg.ignored {
                ArgRole::Fill
            } else if i >= first_out {
                ArgRole::Out(i - first_out)
            } else if let Some(n) = arg.maps {
                ArgRole::Param(n - 1)
            } else {
                next += 1;
                ArgRole::Param(next - 1)
            };
            if let ArgRole::Param(p) = role {
                count = count.max(p + 1);
            }
            role
        })
        .collect();
    (roles, count)
}

#[derive(Debug, Clone)]
enum Source {
    Param(usize),
    Fill(Operand),
    Out(usize),
}

#[derive(Debug, Clone)]
struct ArgPlan {
    class: Class,
    ownership: Option<Ownership>,
    source: Source,
}

#[derive(Debug, Clone)]
struct OutPlan {
    class: Class,
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq)]
enum ErrorRule {
    Never,
    /// Failure when `ret <cmp> operand` holds
    Condition(Cmp, Operand),
    /// Failure when the return is zero, null or an empty string
    Zero,
}

/// Everything about a call that does not depend on argument values
#[derive(Debug, Clone)]
pub struct CallPlan {
    args: Vec<ArgPlan>,
    params: Vec<Kind>,
    outs: Vec<OutPlan>,
    /// Out-param addresses are appended after the declared arguments
    hidden_outs: bool,
    variadic: bool,
    ret: Class,
    primary: Option<Kind>,
    error: ErrorRule,
}

impl CallPlan {
    /// Validate `shape` against `signature` and lay out the call
    pub fn new(signature: &Signature, shape: &FnShape) -> Result<CallPlan, SignatureError> {
        if !signature.func {
            return Err(SignatureError::NotAFunction);
        }
        safety::check_signature(signature)?;

        let (fallible, results) = match shape.results.iter().position(|k| *k == Kind::Error) {
            Some(i) if i + 1 == shape.results.len() => (true, &shape.results[..i]),
            Some(_) => return Err(SignatureError::MisplacedError),
            None => (false, &shape.results[..]),
        };

        let ret = match Class::of(signature.ret.prim) {
            Some(class) => class,
            None => {
                return Err(SignatureError::Unsupported {
                    position: "return".to_string(),
                    reason: format!("aggregate '{}' cannot be returned by value", signature.ret.name),
                })
            }
        };

        let (primary, extras) = match (ret, results.split_first()) {
            (Class::Void, _) | (_, None) => (None, results),
            (class, Some((first, rest))) => {
                if !class.produces(first) {
                    return Err(SignatureError::Incompatible {
                        position: "return".to_string(),
                        kind: first.clone(),
                        class,
                    });
                }
                (Some(first.clone()), rest)
            }
        };

        let variadic = signature.printf_index().is_some();
        if shape.variadic && !variadic {
            return Err(SignatureError::Unsupported {
                position: "shape".to_string(),
                reason: "variadic shape needs a printf-style argument in the tag".to_string(),
            });
        }

        // Out-params: trailing `+scalar` arguments, else hidden slots
        let declared = trailing_initializers(signature);
        let hidden_outs = !extras.is_empty() && declared == 0;
        let out_args = if hidden_outs {
            0
        } else if extras.len() <= declared {
            extras.len()
        } else {
            return Err(SignatureError::OutParams(format!(
                "shape has {} extra result(s) but the tag declares {} trailing '+' argument(s)",
                extras.len(),
                declared
            )));
        };
        if hidden_outs && variadic {
            return Err(SignatureError::OutParams(
                "hidden out-params cannot follow a variadic tail".to_string(),
            ));
        }

        let (roles, param_count) = arg_roles(signature, out_args);
        if param_count != shape.params.len() {
            return Err(SignatureError::Arity {
                expected: shape.params.len(),
                found: param_count,
            });
        }

        let mut outs = Vec::with_capacity(extras.len());
        let mut args = Vec::with_capacity(signature.args.len());
        for (i, (desc, role)) in signature.args.iter().zip(&roles).enumerate() {
            let position = format!("argument {}", i + 1);
            let class = match (Class::of(desc.prim), desc.prim) {
                (Some(class), _) => class,
                (None, Prim::Aggregate) => Class::Pointer,
                (None, _) => {
                    return Err(SignatureError::Unsupported {
                        position,
                        reason: format!("'{}' has no native class", desc.name),
                    })
                }
            };

            let source = match *role {
                ArgRole::Param(p) => {
                    let kind = &shape.params[p];
                    let accepted = match desc.prim {
                        Prim::Aggregate => *kind == Kind::Aggregate,
                        _ => class.accepts(kind),
                    };
                    if !accepted {
                        return Err(SignatureError::Incompatible {
                            position,
                            kind: kind.clone(),
                            class,
                        });
                    }
                    Source::Param(p)
                }
                ArgRole::Fill => Source::Fill(fill_operand(desc, &signature.args)),
                ArgRole::Out(k) => {
                    let kind = &extras[k];
                    let slot = desc.pointee().and_then(Class::of).unwrap_or(Class::Pointer);
                    if !slot.produces(kind) {
                        return Err(SignatureError::Incompatible {
                            position,
                            kind: kind.clone(),
                            class: slot,
                        });
                    }
                    outs.push(OutPlan {
                        class: slot,
                        kind: kind.clone(),
                    });
                    Source::Out(k)
                }
            };

            args.push(ArgPlan {
                class,
                ownership: desc.ownership,
                source,
            });
        }

        if hidden_outs {
            for (k, kind) in extras.iter().enumerate() {
                let class = Class::for_kind(kind)
                    .filter(|class| *class != Class::Void && class.produces(kind))
                    .ok_or_else(|| SignatureError::Unsupported {
                        position: format!("result {}", k + 2),
                        reason: format!("{} cannot be returned through an out-param", kind),
                    })?;
                outs.push(OutPlan {
                    class,
                    kind: kind.clone(),
                });
            }
        }

        let error = match signature.error_condition() {
            Some((cmp, operand)) => ErrorRule::Condition(cmp, operand.clone()),
            None if signature.ret.failure.is_some() || fallible => ErrorRule::Zero,
            None => ErrorRule::Never,
        };

        Ok(CallPlan {
            args,
            params: shape.params.clone(),
            outs,
            hidden_outs,
            variadic,
            ret,
            primary,
            error,
        })
    }

    /// Number of language parameters, excluding a variadic tail
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn is_variadic(&self) -> bool {
        self.variadic
    }

    /// Number of results a successful call returns
    pub fn result_count(&self) -> usize {
        self.primary.iter().count() + self.outs.len()
    }
}

/// Value an ignored argument is filled with
fn fill_operand(desc: &TypeDesc, args: &[TypeDesc]) -> Operand {
    desc.assertions
        .iter()
        .find_map(|assertion| match assertion {
            Assertion::Compare(Cmp::Eq, operand) => Some(operand.clone()),
            Assertion::SizeOf(Operand::Arg(n)) => args
                .get(n - 1)
                .and_then(|target| c_size_of(&target.name))
                .map(|size| Operand::Literal(size as i64)),
            Assertion::SizeOf(operand) => Some(operand.clone()),
            _ => None,
        })
        .unwrap_or(Operand::Literal(0))
}

fn value_matches(expected: &Kind, value: &Value) -> bool {
    match (expected, value) {
        (Kind::Function(shape), Value::Function(f)) => f.shape() == shape,
        (Kind::Function(shape), Value::Callback(t)) => t.shape() == shape,
        (kind, value) => value.kind().as_ref() == Some(kind),
    }
}

/// A callable foreign function
pub struct ForeignFunction {
    name: String,
    address: Address,
    signature: Signature,
    shape: FnShape,
    plan: CallPlan,
    pool: Arc<FramePool>,
    failure_lookup: Option<Address>,
}

impl ForeignFunction {
    /// Prepare calls to `address` described by `signature`
    ///
    /// When `shape` is `None` it is inferred from the signature.
    ///
    /// # Safety
    ///
    /// `address` must be a function with the native signature the tag
    /// describes, and must stay valid as long as this value lives.
    pub unsafe fn new(
        name: impl Into<String>,
        address: Address,
        signature: Signature,
        shape: Option<FnShape>,
        pool: Arc<FramePool>,
    ) -> Result<Self, SignatureError> {
        let shape = match shape {
            Some(shape) => shape,
            None => FnShape::infer(&signature)?,
        };
        let plan = CallPlan::new(&signature, &shape)?;
        Ok(Self {
            name: name.into(),
            address,
            signature,
            shape,
            plan,
            pool,
            failure_lookup: None,
        })
    }

    /// Register the diagnostic lookup named by the tag's `;symbol`
    ///
    /// # Safety
    ///
    /// `lookup` must take the operands the tag lists (or the raw return code)
    /// and return a `char *` message or null.
    pub unsafe fn with_failure_lookup(mut self, lookup: Address) -> Self {
        self.failure_lookup = Some(lookup);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn shape(&self) -> &FnShape {
        &self.shape
    }

    pub fn plan(&self) -> &CallPlan {
        &self.plan
    }

    /// Call the function
    ///
    /// Returns the primary result followed by each out-param. A wrong number
    /// of arguments or an argument of the wrong kind is a contract violation.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, CallError> {
        let plan = &self.plan;
        let fixed = plan.params.len();
        if args.len() < fixed || (!plan.variadic && args.len() != fixed) {
            contract_violation(&format!(
                "{} expects {} argument(s), got {}",
                self.name,
                fixed,
                args.len()
            ));
        }
        for (i, (kind, value)) in plan.params.iter().zip(args).enumerate() {
            if !value_matches(kind, value) {
                contract_violation(&format!(
                    "{}: parameter {} expects {}, got {:?}",
                    self.name,
                    i + 1,
                    kind,
                    value
                ));
            }
        }
        let (args, tail) = args.split_at(fixed);

        let backend = self.pool.backend().as_ref();
        let mut ctx = MarshalContext::new(backend);
        let mut slots = vec![0u64; plan.outs.len()];
        let slot_ptrs: Vec<*mut c_void> = slots
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        let mut states: Vec<ArgState<'_>> = Vec::with_capacity(plan.args.len());
        for arg in &plan.args {
            let state = match arg.source {
                Source::Param(p) => {
                    let value = &args[p];
                    let native = ctx.lower(arg.class, arg.ownership, value)?;
                    ArgState {
                        value: Some(value),
                        native,
                        class: arg.class,
                        capacity: ctx.capacity_of(value),
                    }
                }
                Source::Out(k) => ArgState {
                    value: None,
                    native: NativeValue::Pointer(slot_ptrs[k]),
                    class: Class::Pointer,
                    capacity: Some(std::mem::size_of::<u64>()),
                },
                Source::Fill(_) => ArgState {
                    value: None,
                    native: NativeValue::zero(arg.class),
                    class: arg.class,
                    capacity: None,
                },
            };
            states.push(state);
        }
        for (i, arg) in plan.args.iter().enumerate() {
            if let Source::Fill(operand) = &arg.source {
                let value = safety::operand_value(operand, &states).unwrap_or(0);
                states[i].native = NativeValue::from_int(arg.class, value);
            }
        }

        safety::check_arguments(&self.signature, &states, tail)?;

        let tail_natives = tail
            .iter()
            .map(|value| ctx.lower_variadic(value))
            .collect::<Result<Vec<_>, _>>()?;

        let hidden = if plan.hidden_outs { slot_ptrs.len() } else { 0 };
        let total = states.len() + hidden + tail_natives.len();
        let ret = {
            let mut frame = self.pool.acquire(FramePool::frame_bytes(total), plan.variadic);
            for state in &states {
                frame.push(state.native);
            }
            if plan.hidden_outs {
                for ptr in &slot_ptrs {
                    frame.push_pointer(*ptr);
                }
            }
            if plan.variadic {
                frame.begin_varargs();
                for native in &tail_natives {
                    frame.push(*native);
                }
            }
            trace!(function = %self.name, args = total, "calling foreign function");
            // SAFETY: guaranteed by the contract of `ForeignFunction::new`
            unsafe { frame.invoke(self.address, plan.ret) }
        };
        ctx.commit();

        if self.failed(ret, &states) {
            let err = self.describe_failure(ret, &states);
            self.release_return(ret);
            return Err(CallError::Foreign(err));
        }
        if plan.primary.is_none() {
            self.release_return(ret);
        }

        // Pull before the context drops: a returned pointer may alias an argument

        let mut results = Vec::with_capacity(plan.result_count());
        if let Some(kind) = &plan.primary {
            // SAFETY: a String return is a NUL-terminated string per the tag
            results.push(unsafe { pull_value(ret, plan.ret, kind, Some(&self.signature.ret)) });
        }
        for (out, ptr) in plan.outs.iter().zip(&slot_ptrs) {
            // SAFETY: the slot is a zeroed u64 the callee may have written
            let native = unsafe { read_native(*ptr, out.class) };
            results.push(unsafe { pull_value(native, out.class, &out.kind, None) });
        }
        drop(ctx);
        Ok(results)
    }

    fn failed(&self, ret: NativeValue, states: &[ArgState<'_>]) -> bool {
        match &self.plan.error {
            ErrorRule::Never => false,
            ErrorRule::Zero => match self.plan.ret {
                Class::Void => false,
                // SAFETY: only the first byte of a non-null string is read
                Class::String if !ret.as_ptr().is_null() => unsafe {
                    *(ret.as_ptr() as *const u8) == 0
                },
                class => ret.as_int_of(class) == 0,
            },
            ErrorRule::Condition(cmp, operand) => {
                let lhs = ret.as_int_of(self.plan.ret);
                let rhs = match operand {
                    Operand::Arg(0) => Some(lhs),
                    other => safety::operand_value(other, states),
                };
                rhs.is_some_and(|rhs| cmp.holds(lhs, rhs))
            }
        }
    }

    /// Free a `$` return the caller never receives
    fn release_return(&self, ret: NativeValue) {
        if self.signature.ret.ownership != Some(Ownership::Sold)
            || !matches!(self.plan.ret, Class::String | Class::Pointer)
        {
            return;
        }
        let ptr = ret.as_ptr();
        if !ptr.is_null() {
            trace!(function = %self.name, "releasing unused sold return");
            // SAFETY: a `$` return is C allocator memory handed to the caller
            unsafe { libc::free(ptr) };
        }
    }

    /// Build the error for a failed call, running the diagnostic lookup
    fn describe_failure(&self, ret: NativeValue, states: &[ArgState<'_>]) -> ForeignError {
        let code = ret.as_int_of(self.plan.ret) as i64;
        let failure = self.signature.ret.failure.as_ref();
        let message = match (self.failure_lookup, failure) {
            (Some(lookup), Some(failure)) => {
                let mut operands: Vec<NativeValue> = failure
                    .operands
                    .iter()
                    .map(|operand| match operand {
                        Operand::Arg(0) => ret,
                        Operand::Arg(n) => states
                            .get(n - 1)
                            .map(|s| s.native)
                            .unwrap_or(NativeValue::I32(0)),
                        other => NativeValue::I32(
                            safety::operand_value(other, states).unwrap_or(0) as i32,
                        ),
                    })
                    .collect();
                if failure.operands.is_empty() && ret != NativeValue::Void {
                    operands.push(ret);
                }

                let mut frame = self
                    .pool
                    .acquire(FramePool::frame_bytes(operands.len()), false);
                for operand in operands {
                    frame.push(operand);
                }
                // SAFETY: guaranteed by the contract of `with_failure_lookup`
                let text = unsafe { frame.invoke(lookup, Class::Pointer) }.as_ptr();
                if text.is_null() {
                    None
                } else {
                    // SAFETY: the lookup returns a NUL-terminated message
                    Some(
                        unsafe { CStr::from_ptr(text as *const c_char) }
                            .to_string_lossy()
                            .into_owned(),
                    )
                }
            }
            _ => None,
        };

        ForeignError {
            function: self.name.clone(),
            code,
            symbol: failure
                .filter(|_| self.failure_lookup.is_some())
                .map(|f| f.symbol.clone()),
            message: message.unwrap_or_else(|| format!("{} reported failure", self.name)),
        }
    }
}

impl fmt::Debug for ForeignFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignFunction")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("signature", &self.signature.to_string())
            .field("shape", &self.shape.to_string())
            .finish()
    }
}
