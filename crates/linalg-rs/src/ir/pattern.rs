use crate::error::{LoweringError, LoweringResult};
use crate::ir::{index::InstId, rewriter::ProgramRewriter, spec::Operation};

/// Predicate used to restrict which operations a pattern should consider.
pub type OperationMatcher = fn(&Operation) -> bool;

/// Typed snapshot of a single operation, extracted before a pattern runs.
pub trait OperationView: Clone {
    const MATCHER: OperationMatcher;
    fn extract(root: InstId, rewriter: &ProgramRewriter) -> Option<Self>;
}

mod pattern_views;
pub use pattern_views::*;

/// Base trait for rewrite patterns.
///
/// `match_and_rewrite` either rewrites `root` completely or returns an error
/// without having touched the function.
pub trait Pattern: Send + Sync {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
    fn matches_operation(&self, op: &Operation) -> bool {
        let _ = op;
        true
    }
    fn benefit(&self) -> u16 {
        1
    }
    fn match_and_rewrite(&self, root: InstId, rewriter: &mut ProgramRewriter) -> LoweringResult<()>;
}

/// Typed convenience trait mirroring MLIR's `OpRewritePattern`.
pub trait OpRewritePattern<T> {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
    fn benefit(&self) -> u16 {
        1
    }
    fn match_and_rewrite(&self, op: T, rewriter: &mut ProgramRewriter) -> LoweringResult<()>;
}

/// Adapter converting a typed pattern into a `Pattern`.
pub struct TypedPattern<P, T> {
    pattern: P,
    matcher: Option<OperationMatcher>,
    extractor: fn(InstId, &ProgramRewriter) -> Option<T>,
}

impl<P, T> TypedPattern<P, T> {
    pub fn with_operation_matcher(
        pattern: P,
        matcher: OperationMatcher,
        extractor: fn(InstId, &ProgramRewriter) -> Option<T>,
    ) -> Self {
        Self {
            pattern,
            matcher: Some(matcher),
            extractor,
        }
    }
}

impl<P, V> TypedPattern<P, V>
where
    V: OperationView,
{
    pub fn from_view(pattern: P) -> Self {
        Self::with_operation_matcher(pattern, V::MATCHER, V::extract)
    }
}

impl<P, T> Pattern for TypedPattern<P, T>
where
    P: OpRewritePattern<T> + Send + Sync,
    T: Send,
{
    fn name(&self) -> &'static str {
        self.pattern.name()
    }

    fn matches_operation(&self, op: &Operation) -> bool {
        match self.matcher {
            Some(matcher) => matcher(op),
            None => true,
        }
    }

    fn benefit(&self) -> u16 {
        self.pattern.benefit()
    }

    fn match_and_rewrite(&self, root: InstId, rewriter: &mut ProgramRewriter) -> LoweringResult<()> {
        let Some(view) = (self.extractor)(root, rewriter) else {
            return Err(LoweringError::no_match("operands do not match op signature"));
        };
        self.pattern.match_and_rewrite(view, rewriter)
    }
}

/// Mutable set that collects rewrite patterns prior to freezing.
pub struct PatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl PatternSet {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn add<P>(&mut self, pattern: P) -> &mut Self
    where
        P: Pattern + 'static,
    {
        self.patterns.push(Box::new(pattern));
        self
    }

    pub fn insert_view<V, P>(&mut self, pattern: P) -> &mut Self
    where
        V: OperationView + Send + 'static,
        P: OpRewritePattern<V> + Send + Sync + 'static,
    {
        self.add(TypedPattern::<P, V>::from_view(pattern))
    }

    /// Sorts by descending benefit; patterns of equal benefit keep insertion order.
    pub fn freeze(mut self) -> FrozenPatternSet {
        self.patterns
            .sort_by_key(|pattern| std::cmp::Reverse(pattern.benefit()));
        FrozenPatternSet {
            patterns: self.patterns,
        }
    }
}

impl Default for PatternSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable collection of rewrite patterns ready for use by the driver.
pub struct FrozenPatternSet {
    patterns: Vec<Box<dyn Pattern>>,
}

impl FrozenPatternSet {
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &dyn Pattern)> {
        self.patterns.iter().enumerate().map(|(idx, p)| (idx, &**p))
    }

    pub fn matching<'a>(
        &'a self,
        op: &'a Operation,
    ) -> impl Iterator<Item = (usize, &'a dyn Pattern)> + 'a {
        self.patterns
            .iter()
            .enumerate()
            .filter(move |(_, pattern)| pattern.matches_operation(op))
            .map(|(idx, pattern)| (idx, &**pattern))
    }
}

/// Matchers for the source-level operations that have lowering patterns.
pub mod filters {
    use crate::ir::spec::Operation;

    pub fn mm(op: &Operation) -> bool {
        matches!(op, Operation::Mm)
    }

    pub fn matmul(op: &Operation) -> bool {
        matches!(op, Operation::Matmul)
    }

    pub fn bmm(op: &Operation) -> bool {
        matches!(op, Operation::Bmm)
    }

    pub fn flip(op: &Operation) -> bool {
        matches!(op, Operation::Flip)
    }

    pub fn convolution(op: &Operation) -> bool {
        matches!(op, Operation::Convolution)
    }

    pub fn trilinear(op: &Operation) -> bool {
        matches!(op, Operation::Trilinear)
    }
}

#[macro_export]
macro_rules! register_patterns_for_view {
    ($set:expr, $view:ty, $($pattern:expr),+ $(,)?) => {{
        $( $set.insert_view::<$view, _>($pattern); )+
    }};
}
