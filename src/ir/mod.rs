use std::collections::HashMap;

use educe::Educe;
use typed_generational_arena::{SmallSlab, SmallSlabIndex};

pub mod builder;
pub mod display;
pub mod infer;
mod types;

pub use types::{BlockType, CompositeType, Field, FunctionType, HeapType, RefType, ValType};

pub type LocalIndex = usize;
pub type FieldIndex = usize;

pub type FuncIndex = SmallSlabIndex<Function>;
pub type SigIndex = SmallSlabIndex<FunctionType>;
pub type CompositeIndex = SmallSlabIndex<CompositeType>;
pub type GlobalIndex = SmallSlabIndex<Global>;
pub type TagIndex = SmallSlabIndex<Tag>;

pub type Functions = SmallSlab<Function>;
pub type Signatures = SmallSlab<FunctionType>;
pub type Composites = SmallSlab<CompositeType>;
pub type Globals = SmallSlab<Global>;
pub type Tags = SmallSlab<Tag>;

/// Holds every table a compilation unit is made of.
#[derive(Debug, Clone)]
pub struct Module {
    /// Interned function signatures.
    pub signatures: Signatures,
    /// Struct and array types.
    pub composites: Composites,
    /// Defined and imported functions.
    pub functions: Functions,
    pub globals: Globals,
    /// Exception tags.
    pub tags: Tags,
    /// The function table used by indirect calls.
    pub table: Vec<FuncIndex>,
    signature_ids: HashMap<FunctionType, SigIndex>,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Self {
            signatures: Signatures::new(),
            composites: Composites::new(),
            functions: Functions::new(),
            globals: Globals::new(),
            tags: Tags::new(),
            table: Vec::new(),
            signature_ids: HashMap::new(),
        }
    }

    /// Returns the index of the given signature, adding it if this is the first use.
    pub fn intern_signature(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> SigIndex {
        let ty = FunctionType::new(params, results);
        if let Some(idx) = self.signature_ids.get(&ty) {
            return *idx;
        }
        let idx = self.signatures.insert(ty.clone());
        self.signature_ids.insert(ty, idx);
        idx
    }

    pub fn signature(&self, idx: SigIndex) -> &FunctionType {
        &self.signatures[idx]
    }

    pub fn add_composite(&mut self, ty: CompositeType) -> CompositeIndex {
        self.composites.insert(ty)
    }

    /// Finds a composite type by name.
    pub fn find_composite(&self, name: &str) -> Option<CompositeIndex> {
        self.composites
            .iter()
            .find(|(_, ty)| ty.name() == name)
            .map(|(idx, _)| idx)
    }

    pub fn add_function(&mut self, function: Function) -> FuncIndex {
        self.functions.insert(function)
    }

    /// Declares a function without a body, resolved by name at runtime.
    pub fn import_function(&mut self, name: &str, signature: SigIndex) -> FuncIndex {
        self.functions.insert(Function {
            name: name.to_string(),
            signature,
            body: None,
        })
    }

    pub fn function(&self, idx: FuncIndex) -> &Function {
        &self.functions[idx]
    }

    pub fn find_function(&self, name: &str) -> Option<FuncIndex> {
        self.functions
            .iter()
            .find(|(_, function)| function.name == name)
            .map(|(idx, _)| idx)
    }

    /// The signature of the given function.
    pub fn function_type(&self, idx: FuncIndex) -> &FunctionType {
        self.signature(self.functions[idx].signature)
    }

    pub fn add_global(&mut self, global: Global) -> GlobalIndex {
        self.globals.insert(global)
    }

    pub fn add_tag(&mut self, tag: Tag) -> TagIndex {
        self.tags.insert(tag)
    }

    /// Functions with a body, in declaration order.
    pub fn defined_functions(&self) -> Vec<FuncIndex> {
        self.functions
            .iter()
            .filter(|(_, function)| function.body.is_some())
            .map(|(idx, _)| idx)
            .collect()
    }
}

/// A function, either defined in this unit or imported.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub signature: SigIndex,
    /// `None` for imports.
    pub body: Option<FunctionBody>,
}

#[derive(Debug, Clone)]
pub struct FunctionBody {
    /// Parameters first, in signature order, then declared locals.
    pub locals: Vec<Local>,
    pub exprs: Vec<Expr>,
    /// Hands out node ids and labels that are unique within this body.
    pub ids: IdGenerator,
}

impl FunctionBody {
    pub fn add_local(&mut self, local: Local) -> LocalIndex {
        let id = self.locals.len();
        self.locals.push(local);
        id
    }

    pub fn add_temp_local(&mut self, ty: ValType) -> LocalIndex {
        self.add_local(Local::temp(ty))
    }
}

/// A local slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    /// A name exists for user-defined variables.
    pub name: Option<String>,
    pub ty: ValType,
    pub kind: LocalKind,
}

impl Local {
    pub fn new(name: Option<String>, ty: ValType, kind: LocalKind) -> Self {
        Self { name, ty, kind }
    }

    pub const fn temp(ty: ValType) -> Self {
        Self {
            name: None,
            ty,
            kind: LocalKind::Temp,
        }
    }
}

/// The kind of local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    /// Function argument.
    Arg,
    /// User-declared variable.
    Var,
    /// Compiler-introduced slot.
    Temp,
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: ValType,
    pub mutable: bool,
}

/// An exception tag. Its params are the payload a handler receives.
#[derive(Debug, Clone)]
pub struct Tag {
    pub name: String,
    pub params: Vec<ValType>,
}

/// Identity of an expression node inside one function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

/// The label of a structured construct, used as a branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IdGenerator {
    pub next_node: u32,
    pub next_label: u32,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self {
            next_node: 0,
            next_label: 0,
        }
    }

    pub fn node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    pub fn label(&mut self) -> BlockId {
        let id = BlockId(self.next_label);
        self.next_label += 1;
        id
    }

    pub fn expr(&mut self, kind: ExprKind) -> Expr {
        Expr {
            id: self.node(),
            kind,
        }
    }
}

/// An expression node. Equality ignores node ids.
#[derive(Debug, Clone, Educe)]
#[educe(PartialEq)]
pub struct Expr {
    #[educe(PartialEq(ignore))]
    pub id: NodeId,
    pub kind: ExprKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// A sequencing block, or a loop when `is_loop` is set.
    Block(Block),
    Conditional(Conditional),
    /// Branches to `target` when `condition` is non-zero, otherwise leaves the carried values.
    Branch {
        target: BlockId,
        condition: Box<Expr>,
        value: Option<Box<Expr>>,
    },
    Break {
        target: BlockId,
        value: Option<Box<Expr>>,
    },
    /// A jump table. Out of range selectors go to `default`.
    Switch {
        selector: Box<Expr>,
        targets: Vec<BlockId>,
        default: BlockId,
    },
    Return {
        value: Option<Box<Expr>>,
    },
    Unreachable,
    Try(Try),
    Throw {
        tag: TagIndex,
        args: Vec<Expr>,
    },
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// A typed null reference.
    Null(HeapType),
    GetLocal(LocalIndex),
    SetLocal {
        local: LocalIndex,
        value: Box<Expr>,
    },
    GetGlobal(GlobalIndex),
    SetGlobal {
        global: GlobalIndex,
        value: Box<Expr>,
    },
    IntUnary {
        ty: IntType,
        op: IntUnaryOp,
        operand: Box<Expr>,
    },
    IntBinary {
        ty: IntType,
        op: IntBinaryOp,
        first: Box<Expr>,
        second: Box<Expr>,
    },
    FloatUnary {
        ty: FloatType,
        op: FloatUnaryOp,
        operand: Box<Expr>,
    },
    FloatBinary {
        ty: FloatType,
        op: FloatBinaryOp,
        first: Box<Expr>,
        second: Box<Expr>,
    },
    Conversion {
        from: NumType,
        to: NumType,
        signed: bool,
        operand: Box<Expr>,
    },
    Drop(Box<Expr>),
    Call {
        function: FuncIndex,
        args: Vec<Expr>,
        suspension_point: bool,
    },
    /// Calls through the function table. The selector is evaluated after the arguments.
    IndirectCall {
        signature: SigIndex,
        args: Vec<Expr>,
        selector: Box<Expr>,
        suspension_point: bool,
    },
    /// Calls a function reference. The callee is evaluated after the arguments.
    CallReference {
        signature: SigIndex,
        args: Vec<Expr>,
        callee: Box<Expr>,
        suspension_point: bool,
    },
    FunctionReference(FuncIndex),
    IsNull(Box<Expr>),
    ReferencesEqual {
        first: Box<Expr>,
        second: Box<Expr>,
    },
    Cast {
        value: Box<Expr>,
        target: RefType,
    },
    Test {
        value: Box<Expr>,
        target: RefType,
    },
    ExternConversion {
        kind: ExternConversionKind,
        value: Box<Expr>,
    },
    StructNew {
        ty: CompositeIndex,
        fields: Vec<Expr>,
    },
    StructGet {
        ty: CompositeIndex,
        field: FieldIndex,
        instance: Box<Expr>,
    },
    StructSet {
        ty: CompositeIndex,
        field: FieldIndex,
        instance: Box<Expr>,
        value: Box<Expr>,
    },
    ArrayNewFixed {
        ty: CompositeIndex,
        elements: Vec<Expr>,
    },
    ArrayGet {
        ty: CompositeIndex,
        array: Box<Expr>,
        index: Box<Expr>,
    },
    ArraySet {
        ty: CompositeIndex,
        array: Box<Expr>,
        index: Box<Expr>,
        value: Box<Expr>,
    },
    ArrayLength(Box<Expr>),
    /// Names a value that is already on the operand stack.
    Pop(ValType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: BlockId,
    pub is_loop: bool,
    pub ty: BlockType,
    pub body: Vec<Expr>,
}

/// An if/else. Both arms branch to the same label.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditional {
    pub label: BlockId,
    pub condition: Box<Expr>,
    pub then_body: Vec<Expr>,
    pub else_body: Vec<Expr>,
    pub ty: BlockType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Try {
    pub label: BlockId,
    pub body: Vec<Expr>,
    pub catches: Vec<Catch>,
    pub ty: BlockType,
}

/// A handler. Its body starts with the tag payload on the stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub tag: TagIndex,
    pub body: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntType {
    I32,
    I64,
}

impl IntType {
    pub const fn val_type(self) -> ValType {
        match self {
            IntType::I32 => ValType::I32,
            IntType::I64 => ValType::I64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatType {
    F32,
    F64,
}

impl FloatType {
    pub const fn val_type(self) -> ValType {
        match self {
            FloatType::F32 => ValType::F32,
            FloatType::F64 => ValType::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumType {
    I32,
    I64,
    F32,
    F64,
}

impl NumType {
    pub const fn val_type(self) -> ValType {
        match self {
            NumType::I32 => ValType::I32,
            NumType::I64 => ValType::I64,
            NumType::F32 => ValType::F32,
            NumType::F64 => ValType::F64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntUnaryOp {
    Eqz,
    Clz,
    Ctz,
    Popcnt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntBinaryOp {
    Add,
    Sub,
    Mul,
    DivSigned,
    DivUnsigned,
    RemSigned,
    RemUnsigned,
    And,
    Or,
    Xor,
    Shl,
    ShrSigned,
    ShrUnsigned,
    Eq,
    Ne,
    LtSigned,
    LtUnsigned,
    GtSigned,
    GtUnsigned,
    LeSigned,
    LeUnsigned,
    GeSigned,
    GeUnsigned,
}

impl IntBinaryOp {
    /// Comparisons produce an `i32` regardless of the operand type.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            IntBinaryOp::Eq
                | IntBinaryOp::Ne
                | IntBinaryOp::LtSigned
                | IntBinaryOp::LtUnsigned
                | IntBinaryOp::GtSigned
                | IntBinaryOp::GtUnsigned
                | IntBinaryOp::LeSigned
                | IntBinaryOp::LeUnsigned
                | IntBinaryOp::GeSigned
                | IntBinaryOp::GeUnsigned
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatUnaryOp {
    Neg,
    Abs,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatBinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl FloatBinaryOp {
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            FloatBinaryOp::Eq
                | FloatBinaryOp::Ne
                | FloatBinaryOp::Lt
                | FloatBinaryOp::Gt
                | FloatBinaryOp::Le
                | FloatBinaryOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternConversionKind {
    /// `any.convert_extern`
    ExternToAny,
    /// `extern.convert_any`
    AnyToExtern,
}

impl ExprKind {
    /// The value operands in evaluation order. Nested bodies of structured constructs are not
    /// operands.
    pub fn operands(&self) -> Vec<&Expr> {
        match self {
            ExprKind::Block(_)
            | ExprKind::Try(_)
            | ExprKind::Unreachable
            | ExprKind::I32Const(_)
            | ExprKind::I64Const(_)
            | ExprKind::F32Const(_)
            | ExprKind::F64Const(_)
            | ExprKind::Null(_)
            | ExprKind::GetLocal(_)
            | ExprKind::GetGlobal(_)
            | ExprKind::FunctionReference(_)
            | ExprKind::Pop(_) => Vec::new(),
            ExprKind::Conditional(conditional) => vec![&*conditional.condition],
            ExprKind::Branch {
                condition, value, ..
            } => value.iter().map(|v| &**v).chain([&**condition]).collect(),
            ExprKind::Break { value, .. } | ExprKind::Return { value } => {
                value.iter().map(|v| &**v).collect()
            }
            ExprKind::Switch { selector, .. } => vec![&**selector],
            ExprKind::Throw { args, .. }
            | ExprKind::Call { args, .. }
            | ExprKind::StructNew { fields: args, .. }
            | ExprKind::ArrayNewFixed { elements: args, .. } => args.iter().collect(),
            ExprKind::SetLocal { value, .. }
            | ExprKind::SetGlobal { value, .. }
            | ExprKind::IntUnary { operand: value, .. }
            | ExprKind::FloatUnary { operand: value, .. }
            | ExprKind::Conversion { operand: value, .. }
            | ExprKind::Drop(value)
            | ExprKind::IsNull(value)
            | ExprKind::Cast { value, .. }
            | ExprKind::Test { value, .. }
            | ExprKind::ExternConversion { value, .. }
            | ExprKind::StructGet {
                instance: value, ..
            }
            | ExprKind::ArrayLength(value) => vec![&**value],
            ExprKind::IntBinary { first, second, .. }
            | ExprKind::FloatBinary { first, second, .. }
            | ExprKind::ReferencesEqual { first, second } => vec![&**first, &**second],
            ExprKind::IndirectCall { args, selector, .. } => {
                args.iter().chain([&**selector]).collect()
            }
            ExprKind::CallReference { args, callee, .. } => {
                args.iter().chain([&**callee]).collect()
            }
            ExprKind::StructSet {
                instance, value, ..
            } => vec![&**instance, &**value],
            ExprKind::ArrayGet { array, index, .. } => vec![&**array, &**index],
            ExprKind::ArraySet {
                array,
                index,
                value,
                ..
            } => vec![&**array, &**index, &**value],
        }
    }

    /// Mutable counterpart of [`ExprKind::operands`], same order.
    pub fn operands_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            ExprKind::Block(_)
            | ExprKind::Try(_)
            | ExprKind::Unreachable
            | ExprKind::I32Const(_)
            | ExprKind::I64Const(_)
            | ExprKind::F32Const(_)
            | ExprKind::F64Const(_)
            | ExprKind::Null(_)
            | ExprKind::GetLocal(_)
            | ExprKind::GetGlobal(_)
            | ExprKind::FunctionReference(_)
            | ExprKind::Pop(_) => Vec::new(),
            ExprKind::Conditional(conditional) => vec![&mut *conditional.condition],
            ExprKind::Branch {
                condition, value, ..
            } => value
                .iter_mut()
                .map(|v| &mut **v)
                .chain([&mut **condition])
                .collect(),
            ExprKind::Break { value, .. } | ExprKind::Return { value } => {
                value.iter_mut().map(|v| &mut **v).collect()
            }
            ExprKind::Switch { selector, .. } => vec![&mut **selector],
            ExprKind::Throw { args, .. }
            | ExprKind::Call { args, .. }
            | ExprKind::StructNew { fields: args, .. }
            | ExprKind::ArrayNewFixed { elements: args, .. } => args.iter_mut().collect(),
            ExprKind::SetLocal { value, .. }
            | ExprKind::SetGlobal { value, .. }
            | ExprKind::IntUnary { operand: value, .. }
            | ExprKind::FloatUnary { operand: value, .. }
            | ExprKind::Conversion { operand: value, .. }
            | ExprKind::Drop(value)
            | ExprKind::IsNull(value)
            | ExprKind::Cast { value, .. }
            | ExprKind::Test { value, .. }
            | ExprKind::ExternConversion { value, .. }
            | ExprKind::StructGet {
                instance: value, ..
            }
            | ExprKind::ArrayLength(value) => vec![&mut **value],
            ExprKind::IntBinary { first, second, .. }
            | ExprKind::FloatBinary { first, second, .. }
            | ExprKind::ReferencesEqual { first, second } => vec![&mut **first, &mut **second],
            ExprKind::IndirectCall { args, selector, .. } => {
                args.iter_mut().chain([&mut **selector]).collect()
            }
            ExprKind::CallReference { args, callee, .. } => {
                args.iter_mut().chain([&mut **callee]).collect()
            }
            ExprKind::StructSet {
                instance, value, ..
            } => vec![&mut **instance, &mut **value],
            ExprKind::ArrayGet { array, index, .. } => vec![&mut **array, &mut **index],
            ExprKind::ArraySet {
                array,
                index,
                value,
                ..
            } => vec![&mut **array, &mut **index, &mut **value],
        }
    }

    /// Nested statement lists: block and arm bodies, try bodies and handlers.
    pub fn bodies(&self) -> Vec<&[Expr]> {
        match self {
            ExprKind::Block(block) => vec![block.body.as_slice()],
            ExprKind::Conditional(conditional) => vec![
                conditional.then_body.as_slice(),
                conditional.else_body.as_slice(),
            ],
            ExprKind::Try(try_expr) => std::iter::once(try_expr.body.as_slice())
                .chain(try_expr.catches.iter().map(|c| c.body.as_slice()))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn bodies_mut(&mut self) -> Vec<&mut Vec<Expr>> {
        match self {
            ExprKind::Block(block) => vec![&mut block.body],
            ExprKind::Conditional(conditional) => {
                vec![&mut conditional.then_body, &mut conditional.else_body]
            }
            ExprKind::Try(try_expr) => std::iter::once(&mut try_expr.body)
                .chain(try_expr.catches.iter_mut().map(|c| &mut c.body))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether control never continues to the next node in the same list.
    pub const fn is_terminating(&self) -> bool {
        matches!(
            self,
            ExprKind::Break { .. }
                | ExprKind::Switch { .. }
                | ExprKind::Return { .. }
                | ExprKind::Unreachable
                | ExprKind::Throw { .. }
        )
    }

    /// Whether this node is a call flagged as a suspension point.
    pub const fn is_suspension_point(&self) -> bool {
        matches!(
            self,
            ExprKind::Call {
                suspension_point: true,
                ..
            } | ExprKind::IndirectCall {
                suspension_point: true,
                ..
            } | ExprKind::CallReference {
                suspension_point: true,
                ..
            }
        )
    }
}

/// Whether the last node of a list ends control flow.
pub fn ends_with_terminating(body: &[Expr]) -> bool {
    body.last().is_some_and(|last| last.kind.is_terminating())
}
