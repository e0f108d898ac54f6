//! Package declaration and transaction entry points.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::debug;

use realmvm_foundation::{
    Block, BlockSource, Error, Expr, FuncSource, FuncValue, ObjectInfo, ObjectRef, PackageValue,
    Result, Stmt, Type, TypedValue, Value,
};

use crate::call::is_realm_path;
use crate::machine::Machine;
use crate::op::Op;

/// A checked package, ready to be declared on a machine.
///
/// Every top-level name (types, functions, variables) has a slot in
/// `block`. Methods are registered but get no slot.
#[derive(Clone, Debug)]
pub struct PackageDecl {
    /// Package name.
    pub name: Arc<str>,
    /// Package path.
    pub path: Arc<str>,
    /// Package scope.
    pub block: BlockSource,
    /// Declared types by name.
    pub types: Vec<(Arc<str>, Type)>,
    /// Functions and methods.
    pub funcs: Vec<Arc<FuncSource>>,
    /// Variable declarations, run in order.
    pub vars: Vec<Stmt>,
}

impl PackageDecl {
    /// Creates an empty declaration.
    #[must_use]
    pub fn new(name: &str, path: &str, block: BlockSource) -> Self {
        Self {
            name: Arc::from(name),
            path: Arc::from(path),
            block,
            types: Vec::new(),
            funcs: Vec::new(),
            vars: Vec::new(),
        }
    }

    /// Adds a declared type.
    #[must_use]
    pub fn with_type(mut self, name: &str, t: Type) -> Self {
        self.types.push((Arc::from(name), t));
        self
    }

    /// Adds a function or method.
    #[must_use]
    pub fn with_func(mut self, source: FuncSource) -> Self {
        self.funcs.push(Arc::new(source));
        self
    }

    /// Adds a variable declaration.
    #[must_use]
    pub fn with_var(mut self, stmt: Stmt) -> Self {
        self.vars.push(stmt);
        self
    }

    fn slot(&self, name: &str) -> Result<usize> {
        self.block.index_of(name).ok_or_else(|| {
            Error::internal(format!("{name} has no slot in package {}", self.path))
        })
    }
}

impl Machine {
    // =========================================================================
    // Declaration
    // =========================================================================

    /// Declares a package: builds its block, runs its variable initializers
    /// and `init`, and for realm paths persists it as the realm root.
    ///
    /// # Errors
    ///
    /// Returns `UnhandledPanic` if an initializer panics, or any fatal error.
    /// On error nothing is persisted.
    pub fn declare_package(&mut self, decl: PackageDecl) -> Result<ObjectRef> {
        self.cycles = 0;
        match self.declare_package_inner(decl) {
            Ok(pkg) => Ok(pkg),
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn declare_package_inner(&mut self, decl: PackageDecl) -> Result<ObjectRef> {
        let block = Rc::new(RefCell::new(Block::new(&decl.block, Value::Nil)));
        let pkg = ObjectRef::Package(Rc::new(RefCell::new(PackageValue {
            info: ObjectInfo::default(),
            name: decl.name.clone(),
            path: decl.path.clone(),
            names: decl.block.names.clone(),
            block: Value::Object(ObjectRef::Block(block.clone())),
        })));
        self.packages.insert(decl.path.clone(), pkg.clone());

        for (name, t) in &decl.types {
            let i = decl.slot(name)?;
            block.borrow_mut().values[i] = TypedValue::type_value(t.clone());
        }
        for f in &decl.funcs {
            self.store.register_func_source(f.clone())?;
            if f.is_method {
                continue;
            }
            let i = decl.slot(&f.name)?;
            let fv = FuncValue::from_source(f.clone(), Value::Nil);
            block.borrow_mut().values[i] =
                TypedValue::new(Type::Func(f.ty.clone()), Value::Object(ObjectRef::func(fv)));
        }

        let realm = is_realm_path(&decl.path);
        self.package = Some(pkg.clone());
        if realm {
            self.ensure_realm(&decl.path)?;
            self.realm = Some(decl.path.clone());
        }
        for s in &decl.vars {
            self.run_statement(s.clone())?;
        }
        if decl.block.index_of("init").is_some() {
            self.call_inner(&decl.path, "init", Vec::new())?;
        }

        if realm {
            for (_, t) in &decl.types {
                self.store.set_type(t)?;
            }
            pkg.inc_ref_count();
            self.realm_mut(&decl.path)
                .ok_or_else(|| Error::internal(format!("realm {} is not loaded", decl.path)))?
                .mark_new_real(&pkg)?;
            self.finalize_all_realms()?;
            let writes = self.store.commit()?;
            debug!(path = %decl.path, writes, "declared realm package");
        } else {
            debug!(path = %decl.path, "declared package");
        }
        self.package = None;
        self.realm = None;
        Ok(pkg)
    }

    /// Runs one statement in the current package block.
    ///
    /// # Errors
    ///
    /// Returns an internal error without a current package, and whatever the
    /// statement raises.
    pub fn run_statement(&mut self, stmt: Stmt) -> Result<()> {
        let pkg = self
            .package
            .clone()
            .ok_or_else(|| Error::internal("no current package"))?;
        let block = self.package_block(&pkg)?;
        let depths = self.stack_depths();
        self.push_op(Op::Halt);
        self.push_block(block);
        self.push_exec(&stmt);
        let res = self.run();
        self.truncate_to(depths);
        res
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Calls `pkg_path.name(args...)` as one transaction.
    ///
    /// Every realm touched is finalized and the store committed when the call
    /// returns; on error the transaction is discarded.
    ///
    /// # Errors
    ///
    /// Returns `UnhandledPanic` for a guest panic nobody recovered,
    /// `CycleLimitExceeded` when the budget runs out, and fatal errors.
    pub fn call(&mut self, pkg_path: &str, name: &str, args: Vec<TypedValue>) -> Result<Vec<TypedValue>> {
        self.cycles = 0;
        let res = self
            .call_inner(pkg_path, name, args)
            .and_then(|results| self.commit_transaction().map(|()| results));
        if res.is_err() {
            self.abort();
        }
        res
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.finalize_all_realms()?;
        let writes = self.store.commit()?;
        debug!(writes, cycles = self.cycles, "committed transaction");
        Ok(())
    }

    fn call_inner(&mut self, pkg_path: &str, name: &str, args: Vec<TypedValue>) -> Result<Vec<TypedValue>> {
        let pkg = self.require_package(pkg_path)?;
        let index = match &pkg {
            ObjectRef::Package(p) => p.borrow().index_of(name),
            _ => None,
        }
        .ok_or_else(|| Error::internal(format!("{pkg_path}.{name} is not declared")))?;
        let block = self.package_block(&pkg)?;
        let func = self.read_var(&block, index)?;

        let base = self.values.len();
        self.push_op(Op::Halt);
        self.push_value(func);
        let n = args.len();
        for a in args {
            self.push_value(a);
        }
        self.begin_call(n, false, false, 0)?;
        self.run()?;
        self.reap_values(base)
    }

    // =========================================================================
    // Nested Evaluation
    // =========================================================================

    /// Evaluates an expression in a package's scope to exhaustion.
    ///
    /// Durable state must not change: any write to a persisted object fails
    /// with `ReadOnlyViolation`.
    ///
    /// # Errors
    ///
    /// Returns the evaluation's error; the stacks are restored either way.
    pub fn eval(&mut self, pkg_path: &str, x: &Expr) -> Result<Vec<TypedValue>> {
        let pkg = self.require_package(pkg_path)?;
        let block = self.package_block(&pkg)?;
        let prev = self.package.replace(pkg);
        let prev_realm = self.realm.clone();
        let depths = self.stack_depths();

        self.guard_depth += 1;
        self.push_op(Op::Halt);
        self.push_block(block);
        self.push_eval(x);
        let res = self.run();
        self.guard_depth -= 1;
        self.package = prev;
        self.realm = prev_realm;

        let out = match res {
            Ok(()) => Ok(self.values.split_off(depths.values.min(self.values.len()))),
            Err(err) => {
                self.frames.truncate(depths.frames);
                self.exceptions.clear();
                Err(err)
            }
        };
        self.truncate_to(depths);
        out
    }

    /// Static type of an expression, learned by evaluating it.
    ///
    /// # Errors
    ///
    /// Same as [`Machine::eval`].
    pub fn eval_static_type(&mut self, pkg_path: &str, x: &Expr) -> Result<Option<Type>> {
        Ok(self.eval(pkg_path, x)?.into_iter().next().and_then(|tv| tv.t))
    }

    /// A declared package, if loaded or stored.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn package(&mut self, path: &str) -> Result<Option<ObjectRef>> {
        self.load_package(path)
    }
}
