//! Protected regions and the two-pass exception machinery.
//!
//! Handling is a state machine: a throw enters the search phase, which scans
//! active regions innermost-outward for a matching `catch` or a `filter`
//! that approves; the unwind phase then runs `finally`/`fault` blocks from
//! the throw point up to the chosen handler. `leave` drives the same unwind
//! walk without an exception in flight.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::ops::Range;

use tracing::{debug, error};

use crate::error::ResolutionError;
use crate::metadata::{ExceptionClause, ExceptionKind};
use crate::resolve::Assemblies;
use crate::types::generics::{ConcreteType, GenericLookup};
use crate::types::ImageS;
use crate::value::{ObjectRef, StackValue};
use crate::vm::stack::CallStack;
use crate::vm::StepResult;

/// Where a handler lives: frame, protected section, handler within it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerAddress {
    pub frame_index: usize,
    pub section_index: usize,
    pub handler_index: usize,
}

/// Destination of the current unwind walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindTarget {
    /// A `catch`/`filter` handler chosen by the search phase.
    Handler(HandlerAddress),
    /// The target of a `leave`; `usize::MAX` means "return from the method
    /// once the finally blocks have run".
    Instruction(usize),
}

pub const RETURN_SENTINEL: usize = usize::MAX;

#[derive(Clone, Debug, PartialEq)]
pub enum ExceptionState {
    None,
    /// Thrown, search not yet started.
    Throwing(ObjectRef),
    /// Scanning for a matching catch or approving filter.
    Searching {
        exception: ObjectRef,
        cursor: HandlerAddress,
    },
    /// A filter block is executing on a suspended stack.
    Filtering {
        exception: ObjectRef,
        handler: HandlerAddress,
    },
    /// Running finally/fault blocks on the way to `target`.
    Unwinding {
        exception: Option<ObjectRef>,
        target: UnwindTarget,
        cursor: HandlerAddress,
    },
    /// A finally/fault handler is executing; `endfinally` resumes the walk.
    ExecutingHandler {
        exception: Option<ObjectRef>,
        target: UnwindTarget,
        cursor: HandlerAddress,
    },
}

impl ExceptionState {
    pub fn in_flight(&self) -> bool {
        matches!(
            self,
            ExceptionState::Throwing(_)
                | ExceptionState::Searching { .. }
                | ExceptionState::Unwinding { .. }
        )
    }
}

/// A `try` range with its handlers.
#[derive(Clone)]
pub struct ProtectedSection {
    pub instructions: Range<usize>,
    pub handlers: Vec<Handler>,
}

impl Debug for ProtectedSection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "try {{ {:?} }} {:?}", self.instructions, self.handlers)
    }
}

#[derive(Clone)]
pub struct Handler {
    pub instructions: Range<usize>,
    pub kind: HandlerKind,
}

impl Debug for Handler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {{ {:?} }}", self.kind, self.instructions)
    }
}

#[derive(Clone)]
pub enum HandlerKind {
    Catch(ConcreteType),
    Filter { clause_offset: usize },
    Finally,
    Fault,
}

impl Debug for HandlerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Catch(t) => write!(f, "catch({:?})", t),
            HandlerKind::Filter { clause_offset } => write!(f, "filter({}..)", clause_offset),
            HandlerKind::Finally => write!(f, "finally"),
            HandlerKind::Fault => write!(f, "fault"),
        }
    }
}

/// Group a body's exception clauses by try range and order sections so inner
/// blocks come before outer ones; the active-region scan is then a linear
/// walk that meets the lexical nesting order.
pub fn parse(
    clauses: &[ExceptionClause],
    image: ImageS,
    generics: &GenericLookup,
    world: &Assemblies,
) -> Result<Vec<ProtectedSection>, ResolutionError> {
    let mut sections: HashMap<Range<usize>, Vec<Handler>> = HashMap::new();
    for clause in clauses {
        let try_range = clause.try_offset..clause.try_offset + clause.try_length;
        let handler_range = clause.handler_offset..clause.handler_offset + clause.handler_length;

        let kind = match &clause.kind {
            ExceptionKind::TypedException(t) => {
                HandlerKind::Catch(world.make_concrete(image, generics, t)?)
            }
            ExceptionKind::Filter { offset } => HandlerKind::Filter {
                clause_offset: *offset,
            },
            ExceptionKind::Finally => HandlerKind::Finally,
            ExceptionKind::Fault => HandlerKind::Fault,
        };

        sections.entry(try_range).or_default().push(Handler {
            instructions: handler_range,
            kind,
        });
    }

    let mut v: Vec<_> = sections
        .into_iter()
        .map(|(instructions, handlers)| ProtectedSection {
            instructions,
            handlers,
        })
        .collect();

    v.sort_by_key(|s| (Reverse(s.instructions.start), s.instructions.end));
    Ok(v)
}

impl CallStack {
    /// Advance the exception state machine one transition.
    pub fn handle_exception(&mut self) -> StepResult {
        match self.exception_mode.clone() {
            ExceptionState::None => StepResult::InstructionStepped,
            ExceptionState::Throwing(exception) => self.begin_throwing(exception),
            ExceptionState::Searching { exception, cursor } => {
                self.search_for_handler(exception, cursor)
            }
            ExceptionState::Unwinding {
                exception,
                target,
                cursor,
            } => self.unwind(exception, target, cursor),
            ExceptionState::Filtering { .. } | ExceptionState::ExecutingHandler { .. } => {
                StepResult::InstructionStepped
            }
        }
    }

    fn begin_throwing(&mut self, exception: ObjectRef) -> StepResult {
        debug!(
            exception = ?exception,
            frame = ?self.current_frame().state.info_handle.source,
            ip = self.current_frame().state.ip,
            "throwing"
        );

        // Record the managed stack trace once; rethrow keeps the original.
        let mut trace = String::new();
        for frame in self.frames.iter().rev() {
            let method = &frame.state.info_handle.source;
            trace.push_str(&format!(
                "   at {}.{} (IL offset {})\n",
                method.parent.type_name(),
                method.method.name,
                frame.state.ip
            ));
        }
        exception.as_object(|obj| {
            if let Some(field) = obj.field_named("_stackTrace") {
                if obj.get_field(field) == Some(StackValue::null()) {
                    obj.set_field(field, StackValue::string(trace.as_str()));
                }
            }
        });

        self.exception_mode = ExceptionState::Searching {
            exception,
            cursor: HandlerAddress {
                frame_index: self.frames.len() - 1,
                section_index: 0,
                handler_index: 0,
            },
        };
        self.handle_exception()
    }

    fn search_for_handler(&mut self, exception: ObjectRef, cursor: HandlerAddress) -> StepResult {
        for frame_index in (0..=cursor.frame_index).rev() {
            let frame = &self.frames[frame_index];
            let ip = frame.state.ip;
            let exceptions = frame.state.info_handle.exceptions.clone();

            let section_start = if frame_index == cursor.frame_index {
                cursor.section_index
            } else {
                0
            };

            for (section_index, section) in exceptions.iter().enumerate().skip(section_start) {
                if !section.instructions.contains(&ip) {
                    continue;
                }

                let handler_start =
                    if frame_index == cursor.frame_index && section_index == cursor.section_index {
                        cursor.handler_index
                    } else {
                        0
                    };

                for (handler_index, handler) in
                    section.handlers.iter().enumerate().skip(handler_start)
                {
                    match &handler.kind {
                        HandlerKind::Catch(t) => {
                            let matched = match self.exception_matches(&exception, t) {
                                Ok(m) => m,
                                Err(e) => return StepResult::Error(e.into()),
                            };
                            if matched {
                                self.exception_mode = ExceptionState::Unwinding {
                                    exception: Some(exception),
                                    target: UnwindTarget::Handler(HandlerAddress {
                                        frame_index,
                                        section_index,
                                        handler_index,
                                    }),
                                    cursor: HandlerAddress {
                                        frame_index: self.frames.len() - 1,
                                        section_index: 0,
                                        handler_index: 0,
                                    },
                                };
                                return self.handle_exception();
                            }
                        }
                        HandlerKind::Filter { clause_offset } => {
                            // run the filter block on a clean stack, with
                            // everything above its frame suspended
                            let handler_addr = HandlerAddress {
                                frame_index,
                                section_index,
                                handler_index,
                            };
                            self.exception_mode = ExceptionState::Filtering {
                                exception: exception.clone(),
                                handler: handler_addr,
                            };

                            let (original_ip, original_height, stack_base) = {
                                let frame = &self.frames[frame_index];
                                (frame.state.ip, frame.stack_height, frame.base.stack)
                            };
                            self.original_ip = original_ip;
                            self.original_stack_height = original_height;
                            self.suspend_above(frame_index, stack_base);

                            let frame = &mut self.frames[frame_index];
                            frame.state.ip = *clause_offset;
                            frame.stack_height = 0;
                            frame.exception_stack.push(exception.clone());
                            self.push_stack(StackValue::ObjectRef(exception));

                            return StepResult::InstructionStepped;
                        }
                        // finally and fault are ignored during the search
                        _ => {}
                    }
                }
            }
        }

        // No handler anywhere: the exception surfaces to the API caller.
        let description = self
            .shared
            .assemblies
            .heap_description(&exception)
            .map(|t| t.type_name())
            .unwrap_or_else(|_| "<null>".to_string());
        error!(exception = %description, "unhandled managed exception");

        self.exception_mode = ExceptionState::None;
        self.unhandled_exception = Some(exception);
        self.clear();
        StepResult::MethodThrew
    }

    fn unwind(
        &mut self,
        exception: Option<ObjectRef>,
        target: UnwindTarget,
        cursor: HandlerAddress,
    ) -> StepResult {
        let mut exception = exception;
        let target_frame = match target {
            UnwindTarget::Handler(h) => h.frame_index,
            UnwindTarget::Instruction(_) => cursor.frame_index,
        };

        for frame_index in (target_frame..=cursor.frame_index).rev() {
            let (ip, exceptions) = {
                let frame = &self.frames[frame_index];
                (frame.state.ip, frame.state.info_handle.exceptions.clone())
            };

            let section_start = if frame_index == cursor.frame_index {
                cursor.section_index
            } else {
                0
            };

            for (section_index, section) in exceptions.iter().enumerate().skip(section_start) {
                // never run handlers at or past the target's own section
                if let UnwindTarget::Handler(target_h) = target {
                    if frame_index == target_h.frame_index && section_index >= target_h.section_index
                    {
                        break;
                    }
                }

                let in_try = section.instructions.contains(&ip);

                let exiting = match target {
                    UnwindTarget::Handler(_) => in_try,
                    UnwindTarget::Instruction(target_ip) => {
                        let mut jumping_within_handler = false;
                        let in_handler = section.handlers.iter().any(|h| {
                            let in_h = h.instructions.contains(&ip);
                            if in_h && h.instructions.contains(&target_ip) {
                                jumping_within_handler = true;
                            }
                            in_h
                        });

                        if jumping_within_handler {
                            false
                        } else {
                            (in_try || in_handler) && !section.instructions.contains(&target_ip)
                        }
                    }
                };

                if !exiting {
                    continue;
                }

                let handler_start =
                    if frame_index == cursor.frame_index && section_index == cursor.section_index {
                        cursor.handler_index
                    } else {
                        0
                    };

                for (handler_index, handler) in
                    section.handlers.iter().enumerate().skip(handler_start)
                {
                    // leaving a handler we are inside of never re-enters it
                    if handler.instructions.contains(&ip) {
                        if matches!(
                            handler.kind,
                            HandlerKind::Catch(_) | HandlerKind::Filter { .. }
                        ) {
                            self.frames[frame_index].exception_stack.pop();
                        }
                        continue;
                    }

                    let should_run = match &handler.kind {
                        HandlerKind::Finally => true,
                        HandlerKind::Fault => exception.is_some(),
                        _ => false,
                    };

                    if should_run {
                        let next_cursor = if handler_index + 1 < section.handlers.len() {
                            HandlerAddress {
                                frame_index,
                                section_index,
                                handler_index: handler_index + 1,
                            }
                        } else {
                            HandlerAddress {
                                frame_index,
                                section_index: section_index + 1,
                                handler_index: 0,
                            }
                        };

                        self.exception_mode = ExceptionState::ExecutingHandler {
                            exception: exception.clone(),
                            target,
                            cursor: next_cursor,
                        };

                        debug!(frame_index, handler = ?handler.kind, "running unwind handler");
                        let frame = &mut self.frames[frame_index];
                        frame.state.ip = handler.instructions.start;
                        frame.stack_height = 0;

                        return StepResult::InstructionStepped;
                    }
                }
            }

            if frame_index > target_frame {
                // a static constructor failing wraps the in-flight exception
                if self.frames[frame_index].state.info_handle.is_cctor {
                    if let Some(inner) = exception.take() {
                        exception = Some(self.wrap_type_initialization_error(inner));
                    }
                }
                self.pop_frame_for_unwind();
            }
        }

        self.exception_mode = ExceptionState::None;
        match target {
            UnwindTarget::Handler(target_h) => {
                let handler_start_ip = {
                    let section = &self.frames[target_h.frame_index]
                        .state
                        .info_handle
                        .exceptions[target_h.section_index];
                    section.handlers[target_h.handler_index].instructions.start
                };

                let exception = match exception {
                    Some(e) => e,
                    None => {
                        return StepResult::Error(crate::error::VmError::Execution(
                            crate::error::ExecutionError::NotImplemented(
                                "unwind reached a handler with no exception in flight".to_string(),
                            ),
                        ))
                    }
                };

                let frame = &mut self.frames[target_h.frame_index];
                frame.state.ip = handler_start_ip;
                frame.stack_height = 0;
                frame.exception_stack.push(exception.clone());
                self.truncate_to_top();
                self.push_stack(StackValue::ObjectRef(exception));

                StepResult::InstructionStepped
            }
            UnwindTarget::Instruction(target_ip) => {
                if target_ip == RETURN_SENTINEL {
                    return StepResult::MethodReturned;
                }

                let frame = &mut self.frames[target_frame];
                frame.state.ip = target_ip;
                frame.stack_height = 0;
                self.truncate_to_top();

                StepResult::InstructionStepped
            }
        }
    }

    fn exception_matches(
        &self,
        exception: &ObjectRef,
        catch_type: &ConcreteType,
    ) -> Result<bool, ResolutionError> {
        let world = &self.shared.assemblies;
        let exc_type = world.heap_description(exception)?;
        let catch_td = world.find_concrete_type(catch_type)?;
        world.is_a(exc_type, catch_td)
    }

    fn wrap_type_initialization_error(&self, _inner: ObjectRef) -> ObjectRef {
        match self.new_exception_object("System.TypeInitializationException") {
            Ok(wrapped) => wrapped,
            Err(_) => _inner,
        }
    }
}
