mod tests_compact;
mod tests_copy;
mod tests_space;
