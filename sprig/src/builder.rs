use std::{collections::HashMap, sync::Arc};

use log::debug;

use crate::{
    BuildError, BytecodeWriter, Class, Code, DispatchEntry, Function, HeapObject, HeapRef,
    InstanceFormat, Intrinsic, Method, Mutability, NATIVES, Native, ObjectBody, ObjectFlags,
    ObjectType, Opcode, Program, Selector, SelectorNames, SpecialObjects, Value,
};

#[derive(Debug, Clone)]
pub struct ProgramCreateInfo {
    /// Upper bound on class ids, also the width of one dispatch-table row.
    pub max_classes: u32,
}

impl Default for ProgramCreateInfo {
    fn default() -> Self {
        Self { max_classes: 64 }
    }
}

/// Loads classes, functions and constants into a read-only [`Program`].
pub struct ProgramBuilder {
    objects: Vec<HeapObject>,
    classes: Vec<Value>,
    natives: Vec<Native>,
    statics: Vec<Value>,
    table_offsets: HashMap<Selector, u32>,
    next_offset: u32,
    max_classes: u32,
    names: SelectorNames,
    specials: SpecialObjects,
}

/// Operators every number class answers, with the native implementing each.
const NUMBER_OPERATORS: &[(&str, u8, &str)] = &[
    ("+", 1, "number_add"),
    ("-", 1, "number_sub"),
    ("*", 1, "number_mul"),
    ("==", 1, "number_eq"),
    ("<", 1, "number_lt"),
    ("<=", 1, "number_le"),
    (">", 1, "number_gt"),
    (">=", 1, "number_ge"),
];

const INTEGER_OPERATORS: &[(&str, u8, &str)] = &[
    ("~/", 1, "integer_trunc_div"),
    ("%", 1, "integer_mod"),
    ("&", 1, "integer_bit_and"),
    ("|", 1, "integer_bit_or"),
    ("^", 1, "integer_bit_xor"),
    ("~", 0, "integer_bit_not"),
    ("<<", 1, "integer_shl"),
    (">>", 1, "integer_shr"),
];

impl ProgramBuilder {
    /// Fails when `info.max_classes` cannot hold the built-in classes.
    pub fn new(info: ProgramCreateInfo) -> Result<Self, BuildError> {
        let placeholder = Value::zero();
        let mut builder = Self {
            objects: Vec::new(),
            classes: Vec::new(),
            natives: NATIVES.to_vec(),
            statics: Vec::new(),
            table_offsets: HashMap::new(),
            // row offsets start at 1, entry 0 belongs to noSuchMethod
            next_offset: 1,
            max_classes: info.max_classes,
            names: SelectorNames::new(),
            specials: SpecialObjects {
                null: placeholder,
                true_object: placeholder,
                false_object: placeholder,
                object_class: placeholder,
                null_class: placeholder,
                bool_class: placeholder,
                smi_class: placeholder,
                large_integer_class: placeholder,
                double_class: placeholder,
                array_class: placeholder,
                boxed_class: placeholder,
                coroutine_class: placeholder,
                function_class: placeholder,
                class_class: placeholder,
                initializer_class: placeholder,
                string_class: placeholder,
                error_class: placeholder,
                stack_overflow_error: placeholder,
                no_such_method_error: placeholder,
                wrong_argument_type_error: placeholder,
                index_out_of_bounds_error: placeholder,
                illegal_state_error: placeholder,
                division_by_zero_error: placeholder,
                no_such_method_function: placeholder,
                no_such_method_selector: Selector::method(0, 1),
            },
        };
        builder.bootstrap()?;
        Ok(builder)
    }

    fn push_object(&mut self, object: HeapObject) -> Value {
        self.objects.push(object);
        Value::from_ref(HeapRef::program((self.objects.len() - 1) as u32))
    }

    fn object_mut(&mut self, value: Value) -> Option<&mut HeapObject> {
        let reference = value.as_heap_ref()?;
        self.objects.get_mut(reference.index as usize)
    }

    fn class_mut(&mut self, value: Value) -> Result<&mut Class, BuildError> {
        match self.object_mut(value).map(|object| &mut object.body) {
            Some(ObjectBody::Class(class)) => Ok(class),
            _ => Err(BuildError::NotAClass(value)),
        }
    }

    fn function_mut(&mut self, value: Value) -> Result<&mut Function, BuildError> {
        match self.object_mut(value).map(|object| &mut object.body) {
            Some(ObjectBody::Function(function)) => Ok(function),
            _ => Err(BuildError::NotAFunction(value)),
        }
    }

    fn builtin(&mut self, name: &str, format: InstanceFormat) -> Result<Value, BuildError> {
        let object = self.specials.object_class;
        self.class_with_format(name, Some(object), format)
    }

    fn immutable_instance(&mut self, class: Value) -> Value {
        let mut object = HeapObject::new(class, ObjectBody::Instance(Box::new([])));
        object.flags.insert(ObjectFlags::IMMUTABLE);
        self.push_object(object)
    }

    fn bootstrap(&mut self) -> Result<(), BuildError> {
        let always = |object_type| InstanceFormat::new(object_type, Mutability::Always, 0);
        let never = |object_type| InstanceFormat::new(object_type, Mutability::Never, 0);

        // Class describes itself, its class slot is patched once it exists
        let class_class = self.class_with_format("Class", None, always(ObjectType::Class))?;
        if let Some(object) = self.object_mut(class_class) {
            object.class = class_class;
        }
        self.specials.class_class = class_class;

        let object = self.class_with_format("Object", None, InstanceFormat::instance(0))?;
        if let Ok(class) = self.class_mut(class_class) {
            class.superclass = Some(object);
        }
        self.specials.object_class = object;
        self.specials.null_class = self.builtin("Null", always(ObjectType::Instance))?;
        self.specials.bool_class = self.builtin("Bool", always(ObjectType::Instance))?;
        self.specials.smi_class = self.builtin("Smi", always(ObjectType::Instance))?;
        self.specials.large_integer_class =
            self.builtin("LargeInteger", always(ObjectType::LargeInteger))?;
        self.specials.double_class = self.builtin("Double", always(ObjectType::Double))?;
        self.specials.array_class = self.builtin("Array", never(ObjectType::Array))?;
        self.specials.boxed_class = self.builtin("Boxed", never(ObjectType::Boxed))?;
        self.specials.coroutine_class = self.builtin("Coroutine", never(ObjectType::Coroutine))?;
        self.specials.function_class = self.builtin("Function", always(ObjectType::Function))?;
        self.specials.initializer_class =
            self.builtin("Initializer", always(ObjectType::Initializer))?;
        self.specials.string_class = self.builtin("String", always(ObjectType::String))?;
        self.specials.error_class = self.builtin("Error", InstanceFormat::instance(0))?;

        self.specials.null = self.immutable_instance(self.specials.null_class);
        self.specials.true_object = self.immutable_instance(self.specials.bool_class);
        self.specials.false_object = self.immutable_instance(self.specials.bool_class);

        let error = Some(self.specials.error_class);
        let mut errors = [Value::zero(); 6];
        let names = [
            "StackOverflowError",
            "NoSuchMethodError",
            "ArgumentError",
            "RangeError",
            "StateError",
            "DivisionByZeroError",
        ];
        for (slot, name) in errors.iter_mut().zip(names) {
            let class = self.class_with_format(name, error, InstanceFormat::instance(0))?;
            *slot = self.immutable_instance(class);
        }
        [
            self.specials.stack_overflow_error,
            self.specials.no_such_method_error,
            self.specials.wrong_argument_type_error,
            self.specials.index_out_of_bounds_error,
            self.specials.illegal_state_error,
            self.specials.division_by_zero_error,
        ] = errors;

        self.install_object_methods()?;
        self.install_number_methods()
    }

    fn install_object_methods(&mut self) -> Result<(), BuildError> {
        let selector = self.selector("noSuchMethod", 1);
        self.specials.no_such_method_selector = selector;

        let mut writer = BytecodeWriter::new();
        writer.op(Opcode::EnterNoSuchMethod);
        writer.invoke(Opcode::InvokeMethodUnfold, selector);
        writer.op(Opcode::ExitNoSuchMethod);
        let trampoline = self.function("<noSuchMethod>", 0, writer.finish()?);
        self.specials.no_such_method_function = trampoline;

        let mut writer = BytecodeWriter::new();
        writer.load_const(self.specials.no_such_method_error);
        writer.op(Opcode::Throw);
        let default = self.function("Object.noSuchMethod", 2, writer.finish()?);
        let object = self.specials.object_class;
        self.define_method(object, selector, default)?;

        // identity, also answered inline by the intrinsic
        let equals = self.selector("==", 1);
        let identical = self.function_from_ops(
            "Object.==",
            2,
            &[Opcode::LoadLocal5, Opcode::LoadLocal5, Opcode::Identical, Opcode::Return],
        )?;
        self.set_intrinsic(identical, Intrinsic::ObjectEquals)?;
        self.define_method(object, equals, identical)
    }

    fn install_number_methods(&mut self) -> Result<(), BuildError> {
        let integers = [self.specials.smi_class, self.specials.large_integer_class];
        let double = self.specials.double_class;
        let operators = NUMBER_OPERATORS
            .iter()
            .map(|operator| (operator, true))
            .chain(INTEGER_OPERATORS.iter().map(|operator| (operator, false)));

        for (&(name, arity, native), for_doubles) in operators {
            let selector = self.selector(name, arity);
            let function = self.native_function(name, Opcode::InvokeNative, native)?;
            for class in integers {
                self.define_method(class, selector, function)?;
            }
            if for_doubles {
                self.define_method(double, selector, function)?;
            }
        }
        let divide = self.selector("/", 1);
        let function = self.native_function("/", Opcode::InvokeNative, "double_div")?;
        for class in [self.specials.smi_class, self.specials.large_integer_class, double] {
            self.define_method(class, divide, function)?;
        }
        Ok(())
    }

    pub fn specials(&self) -> &SpecialObjects {
        &self.specials
    }

    pub fn names(&self) -> &SelectorNames {
        &self.names
    }

    pub fn selector(&self, name: &str, arity: u8) -> Selector {
        Selector::method(self.names.intern(name), arity)
    }

    pub fn getter(&self, name: &str) -> Selector {
        Selector::getter(self.names.intern(name))
    }

    pub fn setter(&self, name: &str) -> Selector {
        Selector::setter(self.names.intern(name))
    }

    /// Reserves a dispatch-table row for `selector` and returns the table form of it.
    pub fn table_selector(&mut self, selector: Selector) -> Selector {
        if let Some(&offset) = self.table_offsets.get(&selector) {
            return selector.with_id(offset);
        }
        let offset = self.next_offset;
        self.next_offset += self.max_classes;
        self.table_offsets.insert(selector, offset);
        selector.with_id(offset)
    }

    pub fn class(
        &mut self,
        name: &str,
        superclass: Option<Value>,
        fields: u32,
    ) -> Result<Value, BuildError> {
        self.class_with_format(name, superclass, InstanceFormat::instance(fields))
    }

    pub fn class_with_format(
        &mut self,
        name: &str,
        superclass: Option<Value>,
        format: InstanceFormat,
    ) -> Result<Value, BuildError> {
        let id = self.classes.len() as u32;
        if id >= self.max_classes {
            return Err(BuildError::TooManyClasses(self.max_classes));
        }
        let class = Class {
            name: Arc::from(name),
            id,
            superclass,
            format,
            methods: Vec::new(),
        };
        let value = self.push_object(HeapObject::new(
            self.specials.class_class,
            ObjectBody::Class(class),
        ));
        self.classes.push(value);
        Ok(value)
    }

    pub fn function(&mut self, name: &str, arity: usize, code: Code) -> Value {
        let function = Function {
            name: Arc::from(name),
            arity,
            bytecode: Arc::from(code.bytecode),
            literals: code.literals,
            catch_ranges: code.catch_ranges,
            intrinsic: None,
        };
        self.push_object(HeapObject::new(
            self.specials.function_class,
            ObjectBody::Function(function),
        ))
    }

    /// Function made of operand-free opcodes, handy for trivial bodies.
    pub fn function_from_ops(
        &mut self,
        name: &str,
        arity: usize,
        ops: &[Opcode],
    ) -> Result<Value, BuildError> {
        let mut writer = BytecodeWriter::new();
        ops.iter().for_each(|&op| writer.op(op));
        Ok(self.function(name, arity, writer.finish()?))
    }

    pub fn set_intrinsic(&mut self, function: Value, intrinsic: Intrinsic) -> Result<(), BuildError> {
        self.function_mut(function)?.intrinsic = Some(intrinsic);
        Ok(())
    }

    pub fn define_method(
        &mut self,
        class: Value,
        selector: Selector,
        function: Value,
    ) -> Result<(), BuildError> {
        self.function_mut(function)?;
        let class = self.class_mut(class)?;
        match class.methods.iter_mut().find(|method| method.selector == selector) {
            Some(method) => method.function = function,
            None => class.methods.push(Method { selector, function }),
        }
        Ok(())
    }

    pub fn add_native(&mut self, native: Native) -> Result<u8, BuildError> {
        let index = u8::try_from(self.natives.len()).map_err(|_| BuildError::TooManyNatives)?;
        self.natives.push(native);
        Ok(index)
    }

    pub fn native_index(&self, name: &str) -> Option<u8> {
        self.natives
            .iter()
            .position(|native| native.name == name)
            .and_then(|index| u8::try_from(index).ok())
    }

    /// `Invoke*Native; Throw`: the native result is returned directly, a failure
    /// object pushed by the bridge is thrown.
    pub fn native_function(
        &mut self,
        name: &str,
        op: Opcode,
        native: &'static str,
    ) -> Result<Value, BuildError> {
        let index = self
            .native_index(native)
            .ok_or(BuildError::UnknownNative(native))?;
        let arity = self.natives[index as usize].arity;
        let mut writer = BytecodeWriter::new();
        writer.invoke_native(op, arity, index);
        writer.op(Opcode::Throw);
        Ok(self.function(name, arity as usize, writer.finish()?))
    }

    /// Eagerly initialized static, returns its index.
    pub fn add_static(&mut self, value: Value) -> u32 {
        self.statics.push(value);
        (self.statics.len() - 1) as u32
    }

    /// Static computed by `function` on first `LoadStaticInit`.
    pub fn add_lazy_static(&mut self, function: Value) -> u32 {
        let class = self.specials.initializer_class;
        let initializer = self.push_object(HeapObject::new(class, ObjectBody::Initializer(function)));
        self.add_static(initializer)
    }

    pub fn string(&mut self, value: &str) -> Value {
        let class = self.specials.string_class;
        self.push_object(HeapObject::new(class, ObjectBody::String(Arc::from(value))))
    }

    pub fn large_integer(&mut self, value: i128) -> Value {
        let class = self.specials.large_integer_class;
        self.push_object(HeapObject::new(class, ObjectBody::LargeInteger(value)))
    }

    pub fn double(&mut self, value: f64) -> Value {
        let class = self.specials.double_class;
        self.push_object(HeapObject::new(class, ObjectBody::Double(value)))
    }

    /// Immutable constant instance of `class`.
    pub fn constant(&mut self, class: Value, fields: &[Value]) -> Value {
        let mut object = HeapObject::new(class, ObjectBody::Instance(fields.into()));
        object.flags.insert(ObjectFlags::IMMUTABLE);
        self.push_object(object)
    }

    fn resolve(&self, class: Value, selector: Selector) -> Option<Value> {
        let mut current = Some(class);
        while let Some(value) = current {
            let reference = value.as_heap_ref()?;
            let class = self.objects.get(reference.index as usize)?.as_class()?;
            if let Some(function) = class.method(selector) {
                return Some(function);
            }
            current = class.superclass;
        }
        None
    }

    fn intrinsic_of(&self, function: Value) -> Option<Intrinsic> {
        let reference = function.as_heap_ref()?;
        self.objects
            .get(reference.index as usize)?
            .as_function()?
            .intrinsic
    }

    pub fn finish(self) -> Result<Program, BuildError> {
        let no_such_method = DispatchEntry {
            offset: 0,
            target: self.specials.no_such_method_function,
            intrinsic: None,
        };
        let mut dispatch_table = vec![no_such_method; self.next_offset as usize];
        for (&selector, &offset) in &self.table_offsets {
            for (id, &class) in self.classes.iter().enumerate() {
                let Some(target) = self.resolve(class, selector) else {
                    continue;
                };
                dispatch_table[offset as usize + id] = DispatchEntry {
                    offset,
                    target,
                    intrinsic: self.intrinsic_of(target),
                };
            }
        }
        if self.names.len() > Selector::MAX_ID as usize {
            return Err(BuildError::TooManySelectors);
        }

        let offset_selectors = self
            .table_offsets
            .iter()
            .map(|(&selector, &offset)| (offset, selector))
            .collect();
        debug!(
            "program: {} objects, {} classes, {} dispatch entries, {} natives",
            self.objects.len(),
            self.classes.len(),
            dispatch_table.len(),
            self.natives.len()
        );
        Ok(Program {
            objects: self.objects,
            dispatch_table,
            classes: self.classes,
            natives: self.natives,
            statics: self.statics,
            table_offsets: self.table_offsets,
            offset_selectors,
            names: self.names,
            specials: self.specials,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_builds_distinct_singletons() {
        let program = ProgramBuilder::new(ProgramCreateInfo::default())
            .unwrap()
            .finish()
            .unwrap();
        let specials = &program.specials;
        assert_ne!(specials.null, specials.true_object);
        assert_ne!(specials.true_object, specials.false_object);
        assert_eq!(program.get(specials.null).unwrap().class, specials.null_class);
        assert_eq!(
            program.get(specials.class_class).unwrap().class,
            specials.class_class
        );
        assert!(program.function(specials.no_such_method_function).is_some());
        assert!(program.get(specials.division_by_zero_error).unwrap().is_immutable());
    }

    #[test]
    fn numbers_answer_operators_through_natives() {
        let builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let plus = builder.selector("+", 1);
        let program = builder.finish().unwrap();

        let function = program
            .lookup_method(program.specials.smi_class, plus)
            .unwrap();
        let code = &program.function(function).unwrap().bytecode;
        assert_eq!(code[0], Opcode::InvokeNative as u8);
        assert_eq!(code[2], program.native_index("number_add").unwrap());
        assert_eq!(
            program.lookup_method(program.specials.double_class, plus),
            Some(function)
        );
    }

    #[test]
    fn class_ids_are_bounded() {
        let mut builder = ProgramBuilder::new(ProgramCreateInfo { max_classes: 24 }).unwrap();
        let object = builder.specials().object_class;
        let mut result = Ok(object);
        for n in 0..24 {
            result = builder.class(&format!("C{n}"), Some(object), 0);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(BuildError::TooManyClasses(24)));
    }

    #[test]
    fn bootstrap_rejects_too_few_class_ids() {
        let result = ProgramBuilder::new(ProgramCreateInfo { max_classes: 8 });
        assert!(matches!(result, Err(BuildError::TooManyClasses(8))));
    }

    #[test]
    fn objects_compare_by_identity() {
        let builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let equals = builder.selector("==", 1);
        let program = builder.finish().unwrap();
        let specials = &program.specials;

        let function = program.lookup_method(specials.null_class, equals).unwrap();
        assert_eq!(
            program.function(function).unwrap().intrinsic,
            Some(Intrinsic::ObjectEquals)
        );
        assert_ne!(program.lookup_method(specials.smi_class, equals), Some(function));
    }
}
