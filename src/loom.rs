use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync;
        #[cfg(test)]
        pub(crate) use loom::model;
        #[cfg(test)]
        pub(crate) use loom::thread;
    } else {
        #[cfg(test)]
        #[allow(unused_imports)]
        pub(crate) use std::thread;

        #[cfg(test)]
        #[allow(dead_code)]
        #[inline(always)]
        pub(crate) fn model<R>(f: impl FnOnce() -> R) -> R {
            f()
        }

        pub(crate) mod sync {
            pub(crate) use std::sync::atomic;
        }
    }
}
