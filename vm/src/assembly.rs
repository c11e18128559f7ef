use ahash::AHashMap;

use bytecode::{BytecodeBuilder, ExceptionTable, HandlerRange, StackMapTable};
use object::{
    Class, ClassId, ClassTable, ElementKind, FunctionId, InterfaceId,
    InterfaceTable, ValueKind,
};

use crate::error::FatalError;
use crate::verify;

/// Constant pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Str(String),
}

/// Signature of an interface method slot.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodSig {
    pub params: Vec<ValueKind>,
    pub ret: Option<ValueKind>,
}

/// An interface declaration: named method slots with signatures. Classes
/// provide per-interface method tables resolved at load time.
#[derive(Debug, Clone)]
pub struct InterfaceDecl {
    pub name: String,
    pub methods: Vec<MethodSig>,
}

/// One executable function: bytecode plus everything the machine and the
/// collector need to run and scan it.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    /// Parameter kinds; for instance methods the receiver is params[0].
    pub params: Vec<ValueKind>,
    pub ret: Option<ValueKind>,
    pub local_count: u16,
    /// Maximum operand-stack depth, computed by the verifier.
    pub max_stack: u16,
    /// Vtable slot when this function is a virtual method declaration or
    /// override.
    pub vtable_slot: Option<u16>,
    pub code: Vec<u8>,
    pub stack_maps: StackMapTable,
    pub handlers: ExceptionTable,
}

/// Classes the runtime itself needs to find: the root of the hierarchy,
/// the string class, and the built-in exception types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnown {
    pub object: ClassId,
    pub string: ClassId,
    pub exception: ClassId,
    pub null_reference: ClassId,
    pub index_out_of_range: ClassId,
    pub divide_by_zero: ClassId,
    pub stack_overflow: ClassId,
}

/// An immutable, loaded assembly: function table, class table, interface
/// declarations and constant pool. Shared read-only by every thread.
#[derive(Debug)]
pub struct Assembly {
    pub functions: Vec<Function>,
    pub classes: ClassTable,
    pub interfaces: Vec<InterfaceDecl>,
    pub constants: Vec<Constant>,
    pub well_known: WellKnown,
    function_names: AHashMap<String, FunctionId>,
}

impl Assembly {
    pub(crate) fn from_parts(
        functions: Vec<Function>,
        classes: ClassTable,
        interfaces: Vec<InterfaceDecl>,
        constants: Vec<Constant>,
        well_known: WellKnown,
    ) -> Self {
        let function_names = functions
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), FunctionId(i as u32)))
            .collect();
        Self {
            functions,
            classes,
            interfaces,
            constants,
            well_known,
            function_names,
        }
    }

    #[inline]
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.function_names.get(name).copied()
    }

    #[inline]
    pub fn constant(&self, idx: u16) -> &Constant {
        &self.constants[idx as usize]
    }

    pub fn interface(&self, id: InterfaceId) -> &InterfaceDecl {
        &self.interfaces[id.0 as usize]
    }

    /// Re-run verification over every function and cross-check the stored
    /// stack maps and operand depths against the derived ones. Used on
    /// untrusted image loads and by tests of stack-map exactness.
    pub fn validate(&self) -> Result<(), FatalError> {
        let sigs: Vec<verify::FunctionSig> = self
            .functions
            .iter()
            .map(|f| verify::FunctionSig {
                params: f.params.clone(),
                ret: f.ret,
                vtable_slot: f.vtable_slot,
            })
            .collect();
        for function in &self.functions {
            let analysis = verify::verify_function(
                &verify::VerifyInput {
                    name: &function.name,
                    params: &function.params,
                    ret: function.ret,
                    local_count: function.local_count as usize,
                    code: &function.code,
                    handlers: &function.handlers,
                },
                &verify::VerifyEnv {
                    constants: &self.constants,
                    classes: &self.classes,
                    functions: &sigs,
                    interfaces: &self.interfaces,
                },
            )?;
            if analysis.stack_maps != function.stack_maps {
                return Err(FatalError::MalformedBytecode {
                    function: function.name.clone(),
                    offset: 0,
                    message: "stack maps disagree with symbolic execution"
                        .into(),
                });
            }
            if analysis.max_stack != function.max_stack {
                return Err(FatalError::MalformedBytecode {
                    function: function.name.clone(),
                    offset: 0,
                    message: "operand depth disagrees with symbolic execution"
                        .into(),
                });
            }
        }
        Ok(())
    }
}

struct PendingFunction {
    name: String,
    params: Vec<ValueKind>,
    ret: Option<ValueKind>,
    local_count: u16,
    vtable_slot: Option<u16>,
    body: Option<(Vec<u8>, ExceptionTable)>,
}

/// Programmatic assembly construction, standing in for the external
/// compiler/assembler. Declares classes, interfaces and function signatures
/// up front, attaches bodies, then `finish()` runs verification and derives
/// every function's stack maps and max operand depth.
pub struct AssemblyBuilder {
    classes: Vec<Class>,
    interfaces: Vec<InterfaceDecl>,
    functions: Vec<PendingFunction>,
    constants: Vec<Constant>,
    well_known: WellKnown,
}

impl AssemblyBuilder {
    pub fn new() -> Self {
        let mut builder = Self {
            classes: Vec::new(),
            interfaces: Vec::new(),
            functions: Vec::new(),
            constants: Vec::new(),
            well_known: WellKnown {
                object: ClassId(0),
                string: ClassId(0),
                exception: ClassId(0),
                null_reference: ClassId(0),
                index_out_of_range: ClassId(0),
                divide_by_zero: ClassId(0),
                stack_overflow: ClassId(0),
            },
        };

        let object = builder.declare_class("Object", None, &[], &[]);
        let string = builder.declare_element_class("String", ElementKind::Byte);
        // Exception carries its message string in field 0.
        let exception = builder.declare_class(
            "Exception",
            Some(object),
            &[ValueKind::Ref],
            &[],
        );
        let null_reference = builder.declare_class(
            "NullReferenceException",
            Some(exception),
            &[],
            &[],
        );
        let index_out_of_range = builder.declare_class(
            "IndexOutOfRangeException",
            Some(exception),
            &[],
            &[],
        );
        let divide_by_zero = builder.declare_class(
            "DivideByZeroException",
            Some(exception),
            &[],
            &[],
        );
        let stack_overflow = builder.declare_class(
            "StackOverflowException",
            Some(exception),
            &[],
            &[],
        );

        builder.well_known = WellKnown {
            object,
            string,
            exception,
            null_reference,
            index_out_of_range,
            divide_by_zero,
            stack_overflow,
        };
        builder
    }

    pub fn well_known(&self) -> WellKnown {
        self.well_known
    }

    // ── constants ──────────────────────────────────────────────────

    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        let idx = self.constants.len();
        assert!(idx <= u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        idx as u16
    }

    pub fn int_const(&mut self, value: i64) -> u16 {
        self.add_constant(Constant::Int(value))
    }

    pub fn float_const(&mut self, value: f64) -> u16 {
        self.add_constant(Constant::Float(value))
    }

    pub fn str_const(&mut self, value: impl Into<String>) -> u16 {
        self.add_constant(Constant::Str(value.into()))
    }

    // ── classes ────────────────────────────────────────────────────

    /// Declare a class. `own_fields` extends the base layout; the combined
    /// field list and the base vtable are inherited.
    pub fn declare_class(
        &mut self,
        name: &str,
        base: Option<ClassId>,
        own_fields: &[ValueKind],
        static_kinds: &[ValueKind],
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        let mut fields = match base {
            Some(b) => self.classes[b.0 as usize].fields.clone(),
            None => Vec::new(),
        };
        fields.extend_from_slice(own_fields);
        let mut class =
            Class::new(id, name, base, fields, None, static_kinds);
        if let Some(b) = base {
            class.vtable = self.classes[b.0 as usize].vtable.clone();
            class.interfaces = self.classes[b.0 as usize].interfaces.clone();
        }
        self.classes.push(class);
        id
    }

    /// Declare an array or string class with the given element kind.
    pub fn declare_element_class(
        &mut self,
        name: &str,
        element: ElementKind,
    ) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(Class::new(
            id,
            name,
            None,
            Vec::new(),
            Some(element),
            &[],
        ));
        id
    }

    /// Number of fields already occupied by the class layout; the next
    /// declared field lands at this slot.
    pub fn field_count(&self, class: ClassId) -> usize {
        self.classes[class.0 as usize].fields.len()
    }

    // ── interfaces / virtual dispatch ──────────────────────────────

    pub fn declare_interface(
        &mut self,
        name: &str,
        methods: Vec<MethodSig>,
    ) -> InterfaceId {
        let id = InterfaceId(self.interfaces.len() as u32);
        self.interfaces.push(InterfaceDecl { name: name.into(), methods });
        id
    }

    pub fn implement_interface(
        &mut self,
        class: ClassId,
        interface: InterfaceId,
        methods: Vec<FunctionId>,
    ) {
        let decl = &self.interfaces[interface.0 as usize];
        assert_eq!(
            decl.methods.len(),
            methods.len(),
            "interface method count mismatch for {}",
            decl.name
        );
        for (sig, &func) in decl.methods.iter().zip(&methods) {
            let f = &self.functions[func.0 as usize];
            assert_eq!(f.params, sig.params, "interface signature mismatch");
            assert_eq!(f.ret, sig.ret, "interface signature mismatch");
        }
        let tables = &mut self.classes[class.0 as usize].interfaces;
        if let Some(t) = tables.iter_mut().find(|t| t.interface == interface) {
            t.methods = methods;
        } else {
            tables.push(InterfaceTable { interface, methods });
        }
    }

    /// Introduce a new virtual slot on `class`, bound to `func`. Returns
    /// the slot index; `CallVirtual` sites reference `func` and dispatch
    /// through this slot.
    pub fn define_virtual(&mut self, class: ClassId, func: FunctionId) -> u16 {
        let vtable = &mut self.classes[class.0 as usize].vtable;
        let slot = vtable.len() as u16;
        vtable.push(func);
        self.functions[func.0 as usize].vtable_slot = Some(slot);
        slot
    }

    /// Override an inherited virtual slot (named by the base method's
    /// declaration) with `func` on `class`.
    pub fn override_virtual(
        &mut self,
        class: ClassId,
        base_method: FunctionId,
        func: FunctionId,
    ) {
        let base = &self.functions[base_method.0 as usize];
        let slot = base
            .vtable_slot
            .expect("override target is not a virtual method");
        {
            let (sig_params, sig_ret) = (base.params.clone(), base.ret);
            let f = &self.functions[func.0 as usize];
            assert_eq!(f.params, sig_params, "override signature mismatch");
            assert_eq!(f.ret, sig_ret, "override signature mismatch");
        }
        self.classes[class.0 as usize].vtable[slot as usize] = func;
        self.functions[func.0 as usize].vtable_slot = Some(slot);
    }

    // ── functions ──────────────────────────────────────────────────

    /// Declare a function signature. Bodies may reference any declared
    /// function, so mutual recursion needs no forward hackery.
    pub fn declare_function(
        &mut self,
        name: &str,
        params: Vec<ValueKind>,
        ret: Option<ValueKind>,
        local_count: u16,
    ) -> FunctionId {
        assert!(
            params.len() <= local_count as usize,
            "locals must cover the parameters"
        );
        assert!(
            self.functions.iter().all(|f| f.name != name),
            "duplicate function name `{name}`"
        );
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(PendingFunction {
            name: name.into(),
            params,
            ret,
            local_count,
            vtable_slot: None,
            body: None,
        });
        id
    }

    pub fn define_body(
        &mut self,
        id: FunctionId,
        code: BytecodeBuilder,
        handlers: Vec<HandlerRange>,
    ) {
        let pending = &mut self.functions[id.0 as usize];
        assert!(pending.body.is_none(), "body defined twice");
        pending.body = Some((
            code.into_bytes(),
            ExceptionTable::from_ranges(handlers),
        ));
    }

    /// Convenience: declare and immediately define a non-virtual function.
    pub fn define_function(
        &mut self,
        name: &str,
        params: Vec<ValueKind>,
        ret: Option<ValueKind>,
        local_count: u16,
        code: BytecodeBuilder,
        handlers: Vec<HandlerRange>,
    ) -> FunctionId {
        let id = self.declare_function(name, params, ret, local_count);
        self.define_body(id, code, handlers);
        id
    }

    /// Verify every function, derive stack maps and operand depths, and
    /// seal the assembly.
    pub fn finish(self) -> Result<Assembly, FatalError> {
        let classes = ClassTable::new(self.classes);
        let sigs: Vec<verify::FunctionSig> = self
            .functions
            .iter()
            .map(|f| verify::FunctionSig {
                params: f.params.clone(),
                ret: f.ret,
                vtable_slot: f.vtable_slot,
            })
            .collect();

        let mut functions = Vec::with_capacity(self.functions.len());
        for pending in self.functions {
            let (code, handlers) = pending.body.ok_or_else(|| {
                FatalError::MalformedBytecode {
                    function: pending.name.clone(),
                    offset: 0,
                    message: "function declared without a body".into(),
                }
            })?;
            let analysis = verify::verify_function(
                &verify::VerifyInput {
                    name: &pending.name,
                    params: &pending.params,
                    ret: pending.ret,
                    local_count: pending.local_count as usize,
                    code: &code,
                    handlers: &handlers,
                },
                &verify::VerifyEnv {
                    constants: &self.constants,
                    classes: &classes,
                    functions: &sigs,
                    interfaces: &self.interfaces,
                },
            )?;
            functions.push(Function {
                name: pending.name,
                params: pending.params,
                ret: pending.ret,
                local_count: pending.local_count,
                max_stack: analysis.max_stack,
                vtable_slot: pending.vtable_slot,
                code,
                stack_maps: analysis.stack_maps,
                handlers,
            });
        }

        Ok(Assembly::from_parts(
            functions,
            classes,
            self.interfaces,
            self.constants,
            self.well_known,
        ))
    }
}

impl Default for AssemblyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
